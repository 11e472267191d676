//! Push channel.

use super::{ChannelSender, GatewayError, Outcome, payload_mismatch, unsupported_recipient};
use crate::models::{NotificationPayload, PushContent, Recipient};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Trait for push services (FCM, APNs, ...). Device token lookup is the
/// gateway's concern; the sender only knows user ids.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send_push(&self, user_id: Uuid, push: &PushContent) -> Result<String, GatewayError>;

    fn name(&self) -> &'static str;
}

/// Sender for the push channel. Addresses `Recipient::User` only.
pub struct PushSender<G: PushGateway> {
    gateway: Arc<G>,
}

impl<G: PushGateway> PushSender<G> {
    pub fn new(gateway: G) -> Self {
        Self {
            gateway: Arc::new(gateway),
        }
    }

    pub fn with_arc(gateway: Arc<G>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl<G: PushGateway + 'static> ChannelSender for PushSender<G> {
    async fn send(&self, recipient: &Recipient, payload: &NotificationPayload) -> Outcome {
        let NotificationPayload::Push(push) = payload else {
            return payload_mismatch(ChannelSender::name(self), payload);
        };
        let Recipient::User(user_id) = recipient else {
            return unsupported_recipient(ChannelSender::name(self), recipient);
        };

        match self.gateway.send_push(*user_id, push).await {
            Ok(message_id) => {
                debug!(gateway = self.gateway.name(), user_id = %user_id, message_id = %message_id, "Push accepted");
                Outcome::Sent
            }
            Err(e) => e.into(),
        }
    }

    fn name(&self) -> &'static str {
        "push"
    }
}
