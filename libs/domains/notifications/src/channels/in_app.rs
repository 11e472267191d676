//! In-app channel: per-user inbox held in process memory.

use super::{ChannelSender, Outcome, payload_mismatch, unsupported_recipient};
use crate::models::{Channel, MessageContent, NotificationPayload, Priority, Recipient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Default number of messages kept per user; older ones are dropped first.
pub const DEFAULT_INBOX_CAPACITY: usize = 500;

/// A message as the user's client sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: Uuid,
    pub channel: Channel,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub data: serde_json::Value,
    pub action_url: Option<String>,
    pub delivered_at: DateTime<Utc>,
    pub read: bool,
}

impl InboxMessage {
    pub(crate) fn from_content(channel: Channel, content: &MessageContent) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel,
            title: content.title.clone(),
            message: content.message.clone(),
            priority: content.priority,
            data: content.data.clone(),
            action_url: content.action_url.clone(),
            delivered_at: Utc::now(),
            read: false,
        }
    }
}

/// Shared per-user inbox. Cloning shares the same storage.
#[derive(Clone)]
pub struct InAppInbox {
    messages: Arc<RwLock<HashMap<Uuid, VecDeque<InboxMessage>>>>,
    capacity: usize,
}

impl InAppInbox {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Append a message for `user_id`, evicting the oldest past capacity.
    pub async fn deliver(&self, user_id: Uuid, message: InboxMessage) {
        let mut inboxes = self.messages.write().await;
        let inbox = inboxes.entry(user_id).or_default();
        inbox.push_back(message);
        while inbox.len() > self.capacity {
            inbox.pop_front();
        }
    }

    /// Messages for a user, oldest first.
    pub async fn messages(&self, user_id: Uuid) -> Vec<InboxMessage> {
        let inboxes = self.messages.read().await;
        inboxes
            .get(&user_id)
            .map(|inbox| inbox.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn unread_count(&self, user_id: Uuid) -> usize {
        let inboxes = self.messages.read().await;
        inboxes
            .get(&user_id)
            .map(|inbox| inbox.iter().filter(|m| !m.read).count())
            .unwrap_or(0)
    }

    /// Mark one message read. Returns false when it does not exist.
    pub async fn mark_read(&self, user_id: Uuid, message_id: Uuid) -> bool {
        let mut inboxes = self.messages.write().await;
        let Some(message) = inboxes
            .get_mut(&user_id)
            .and_then(|inbox| inbox.iter_mut().find(|m| m.id == message_id))
        else {
            return false;
        };
        message.read = true;
        true
    }
}

impl Default for InAppInbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Sender for user, in-app and scheduled-user messages.
pub struct InAppSender {
    inbox: InAppInbox,
}

impl InAppSender {
    pub fn new(inbox: InAppInbox) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl ChannelSender for InAppSender {
    async fn send(&self, recipient: &Recipient, payload: &NotificationPayload) -> Outcome {
        let content = match payload {
            NotificationPayload::User(m) | NotificationPayload::InApp(m) => m,
            NotificationPayload::ScheduledUser(s) => &s.content,
            other => return payload_mismatch(self.name(), other),
        };
        let Recipient::User(user_id) = recipient else {
            return unsupported_recipient(self.name(), recipient);
        };

        self.inbox
            .deliver(*user_id, InboxMessage::from_content(payload.channel(), content))
            .await;
        Outcome::Sent
    }

    fn name(&self) -> &'static str {
        "in_app"
    }
}
