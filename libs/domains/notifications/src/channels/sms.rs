//! SMS channel.

use super::{ChannelSender, GatewayError, Outcome, payload_mismatch, unsupported_recipient};
use crate::models::{NotificationPayload, Recipient};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Carrier segment limit for a single GSM-7 message, times the concatenation cap.
const MAX_SMS_CHARS: usize = 160 * 10;

/// Trait for SMS carriers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Submit one text. Returns the carrier's message id.
    async fn send_sms(&self, to: &str, body: &str) -> Result<String, GatewayError>;

    fn name(&self) -> &'static str;
}

/// Sender for the SMS channel. Addresses `Recipient::Phone` only.
pub struct SmsSender<G: SmsGateway> {
    gateway: Arc<G>,
}

impl<G: SmsGateway> SmsSender<G> {
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
impl<G: SmsGateway + 'static> ChannelSender for SmsSender<G> {
    async fn send(&self, recipient: &Recipient, payload: &NotificationPayload) -> Outcome {
        let NotificationPayload::Sms(sms) = payload else {
            return payload_mismatch(ChannelSender::name(self), payload);
        };
        let Recipient::Phone(number) = recipient else {
            return unsupported_recipient(ChannelSender::name(self), recipient);
        };
        if sms.body.chars().count() > MAX_SMS_CHARS {
            return Outcome::PermanentError(format!(
                "sms body exceeds {} characters",
                MAX_SMS_CHARS
            ));
        }

        match self.gateway.send_sms(number, &sms.body).await {
            Ok(message_id) => {
                debug!(gateway = self.gateway.name(), message_id = %message_id, "SMS accepted");
                Outcome::Sent
            }
            Err(e) => e.into(),
        }
    }

    fn name(&self) -> &'static str {
        "sms"
    }
}
