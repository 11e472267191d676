//! Team broadcast channel.
//!
//! The dispatcher expands team ids into member user ids before sending, so
//! this sender sees one member at a time.

use super::{ChannelSender, InAppInbox, InboxMessage, Outcome, payload_mismatch, unsupported_recipient};
use crate::models::{Channel, NotificationPayload, Recipient};
use async_trait::async_trait;

/// Delivers team messages into each member's inbox.
pub struct TeamBroadcastSender {
    inbox: InAppInbox,
}

impl TeamBroadcastSender {
    pub fn new(inbox: InAppInbox) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl ChannelSender for TeamBroadcastSender {
    async fn send(&self, recipient: &Recipient, payload: &NotificationPayload) -> Outcome {
        let NotificationPayload::Team(content) = payload else {
            return payload_mismatch(self.name(), payload);
        };
        // Team ids reaching here mean expansion was skipped upstream
        let Recipient::User(member) = recipient else {
            return unsupported_recipient(self.name(), recipient);
        };

        self.inbox
            .deliver(*member, InboxMessage::from_content(Channel::Team, content))
            .await;
        Outcome::Sent
    }

    fn name(&self) -> &'static str {
        "team"
    }
}
