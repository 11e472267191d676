//! Dry-run carrier that only logs.

use super::{EmailProvider, GatewayError, PushGateway, SmsGateway};
use crate::models::{EmailContent, PushContent};
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

/// Carrier stand-in for environments without real email/SMS/push wiring.
///
/// Every send succeeds and is logged at `info!` with a generated message id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingGateway;

impl LoggingGateway {
    fn message_id(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::now_v7())
    }
}

#[async_trait]
impl EmailProvider for LoggingGateway {
    async fn send_email(&self, to: &str, email: &EmailContent) -> Result<String, GatewayError> {
        let message_id = Self::message_id("email");
        info!(to = %to, subject = %email.subject, message_id = %message_id, "[dry-run] email");
        Ok(message_id)
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

#[async_trait]
impl SmsGateway for LoggingGateway {
    async fn send_sms(&self, to: &str, body: &str) -> Result<String, GatewayError> {
        let message_id = Self::message_id("sms");
        info!(to = %to, chars = body.chars().count(), message_id = %message_id, "[dry-run] sms");
        Ok(message_id)
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

#[async_trait]
impl PushGateway for LoggingGateway {
    async fn send_push(&self, user_id: Uuid, push: &PushContent) -> Result<String, GatewayError> {
        let message_id = Self::message_id("push");
        info!(user_id = %user_id, title = %push.title, message_id = %message_id, "[dry-run] push");
        Ok(message_id)
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_gateway_always_succeeds() {
        let gateway = LoggingGateway;
        let id = gateway
            .send_email("a@b.io", &EmailContent::new("s", "b"))
            .await
            .unwrap();
        assert!(id.starts_with("email-"));

        let id = gateway.send_sms("+15550100", "hi").await.unwrap();
        assert!(id.starts_with("sms-"));
    }
}
