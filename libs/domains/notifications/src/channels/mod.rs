//! Channel senders.
//!
//! A `ChannelSender` turns one (recipient, payload) pair into an `Outcome`.
//! Classifying failures as retryable or permanent is the sender's job; the
//! dispatcher only acts on the three-way outcome.
//!
//! Carrier-facing senders (`EmailSender`, `SmsSender`, `PushSender`) wrap a
//! gateway trait and map `GatewayError` through `is_retryable`. The carrier
//! wiring itself lives outside this crate.

mod email;
mod in_app;
mod logging;
mod push;
mod registry;
mod sms;
mod team;

pub use email::{EmailProvider, EmailSender};
pub use in_app::{InAppInbox, InAppSender, InboxMessage};
pub use logging::LoggingGateway;
pub use push::{PushGateway, PushSender};
pub use registry::ChannelRegistry;
pub use sms::{SmsGateway, SmsSender};
pub use team::TeamBroadcastSender;

#[cfg(test)]
pub use email::MockEmailProvider;
#[cfg(test)]
pub use push::MockPushGateway;
#[cfg(test)]
pub use sms::MockSmsGateway;

use crate::models::{NotificationPayload, Recipient};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Result of one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    /// Transient failure; the job may be retried.
    RetryableError(String),
    /// Will never succeed for this recipient.
    PermanentError(String),
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Sent => OutcomeKind::Sent,
            Outcome::RetryableError(_) => OutcomeKind::RetryableError,
            Outcome::PermanentError(_) => OutcomeKind::PermanentError,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Outcome::Sent => None,
            Outcome::RetryableError(detail) | Outcome::PermanentError(detail) => Some(detail),
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, Outcome::Sent)
    }
}

/// Outcome without its detail, as stored in the attempt log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Sent,
    RetryableError,
    PermanentError,
}

/// Trait for per-channel delivery capabilities.
///
/// Senders may see the same (recipient, payload) more than once: the queue is
/// at-least-once, so a crash between send and ack replays the job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Deliver `payload` to a single, already-expanded recipient.
    async fn send(&self, recipient: &Recipient, payload: &NotificationPayload) -> Outcome;

    /// Sender name for logging.
    fn name(&self) -> &'static str;
}

/// Carrier gateway failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("gateway timed out: {0}")]
    Timeout(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("rejected by carrier: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Transient carrier conditions are retryable; anything about the
    /// destination or content is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_) | GatewayError::Unavailable(_) | GatewayError::RateLimited(_)
        )
    }
}

impl From<GatewayError> for Outcome {
    fn from(err: GatewayError) -> Self {
        if err.is_retryable() {
            Outcome::RetryableError(err.to_string())
        } else {
            Outcome::PermanentError(err.to_string())
        }
    }
}

/// Permanent outcome for a payload routed to the wrong sender.
pub(crate) fn payload_mismatch(sender: &str, payload: &NotificationPayload) -> Outcome {
    Outcome::PermanentError(format!(
        "{} sender cannot deliver {} payloads",
        sender,
        payload.channel()
    ))
}

/// Permanent outcome for a recipient kind the channel cannot address.
pub(crate) fn unsupported_recipient(sender: &str, recipient: &Recipient) -> Outcome {
    Outcome::PermanentError(format!(
        "{} sender cannot address {} recipients",
        sender,
        recipient.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_classification() {
        assert!(GatewayError::Timeout("5s".into()).is_retryable());
        assert!(GatewayError::Unavailable("503".into()).is_retryable());
        assert!(GatewayError::RateLimited("slow down".into()).is_retryable());
        assert!(!GatewayError::InvalidDestination("no such mailbox".into()).is_retryable());
        assert!(!GatewayError::Rejected("spam".into()).is_retryable());
    }

    #[test]
    fn test_gateway_error_into_outcome() {
        let outcome: Outcome = GatewayError::Timeout("5s".into()).into();
        assert_eq!(outcome, Outcome::RetryableError("gateway timed out: 5s".into()));
        assert_eq!(outcome.kind(), OutcomeKind::RetryableError);

        let outcome: Outcome = GatewayError::InvalidDestination("+1".into()).into();
        assert_eq!(outcome.kind(), OutcomeKind::PermanentError);
        assert_eq!(outcome.detail(), Some("invalid destination: +1"));
    }

    #[test]
    fn test_outcome_kind_strings() {
        assert_eq!(OutcomeKind::RetryableError.to_string(), "retryable_error");
        assert_eq!(OutcomeKind::Sent.as_ref(), "sent");
        assert!(Outcome::Sent.is_sent());
        assert!(Outcome::Sent.detail().is_none());
    }
}
