//! Email channel.

use super::{ChannelSender, GatewayError, Outcome, payload_mismatch, unsupported_recipient};
use crate::models::{EmailContent, NotificationPayload, Recipient};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Trait for email carriers (SMTP relay, SendGrid, SES, ...).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Hand one email to the carrier. Returns the carrier's message id.
    async fn send_email(&self, to: &str, email: &EmailContent) -> Result<String, GatewayError>;

    /// Get the provider name for logging.
    fn name(&self) -> &'static str;
}

/// Sender for the email channel. Addresses `Recipient::Email` only.
pub struct EmailSender<P: EmailProvider> {
    provider: Arc<P>,
}

impl<P: EmailProvider> EmailSender<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    pub fn with_arc(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P: EmailProvider + 'static> ChannelSender for EmailSender<P> {
    async fn send(&self, recipient: &Recipient, payload: &NotificationPayload) -> Outcome {
        let NotificationPayload::Email(email) = payload else {
            return payload_mismatch(ChannelSender::name(self), payload);
        };
        let Recipient::Email(address) = recipient else {
            return unsupported_recipient(ChannelSender::name(self), recipient);
        };

        match self.provider.send_email(address, email).await {
            Ok(message_id) => {
                debug!(
                    provider = self.provider.name(),
                    to = %address,
                    message_id = %message_id,
                    "Email accepted by provider"
                );
                Outcome::Sent
            }
            Err(e) => e.into(),
        }
    }

    fn name(&self) -> &'static str {
        "email"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::OutcomeKind;
    use crate::models::SmsContent;
    use uuid::Uuid;

    fn email() -> NotificationPayload {
        NotificationPayload::Email(EmailContent::new("Invoice #42", "Attached."))
    }

    #[tokio::test]
    async fn test_sends_to_email_recipient() {
        let mut provider = MockEmailProvider::new();
        provider
            .expect_send_email()
            .withf(|to, email| to == "ana@example.com" && email.subject == "Invoice #42")
            .times(1)
            .returning(|_, _| Ok("msg-1".to_string()));
        provider.expect_name().return_const("mock");

        let sender = EmailSender::new(provider);
        let outcome = sender
            .send(&Recipient::Email("ana@example.com".into()), &email())
            .await;
        assert_eq!(outcome, Outcome::Sent);
    }

    #[tokio::test]
    async fn test_classifies_provider_errors() {
        let mut provider = MockEmailProvider::new();
        provider
            .expect_send_email()
            .returning(|to, _| match to {
                "busy@example.com" => Err(GatewayError::RateLimited("429".into())),
                _ => Err(GatewayError::InvalidDestination("mailbox unknown".into())),
            });

        let sender = EmailSender::new(provider);
        let busy = sender
            .send(&Recipient::Email("busy@example.com".into()), &email())
            .await;
        assert_eq!(busy.kind(), OutcomeKind::RetryableError);

        let gone = sender
            .send(&Recipient::Email("gone@example.com".into()), &email())
            .await;
        assert_eq!(gone.kind(), OutcomeKind::PermanentError);
    }

    #[tokio::test]
    async fn test_rejects_wrong_recipient_and_payload() {
        let mut provider = MockEmailProvider::new();
        provider.expect_send_email().never();
        let sender = EmailSender::new(provider);

        let outcome = sender.send(&Recipient::User(Uuid::new_v4()), &email()).await;
        assert_eq!(outcome.kind(), OutcomeKind::PermanentError);

        let sms = NotificationPayload::Sms(SmsContent { body: "hi".into() });
        let outcome = sender
            .send(&Recipient::Email("ana@example.com".into()), &sms)
            .await;
        assert_eq!(outcome.kind(), OutcomeKind::PermanentError);
    }
}
