//! Error types for the notifications domain.

use crate::models::Channel;
use job_queue::QueueError;
use thiserror::Error;

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur in the notifications domain.
///
/// Only enqueue-time errors reach collaborators directly. Failures after a job
/// is accepted are recorded as delivery attempts and surface through the
/// status and history queries.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Malformed job: empty recipients, unknown channel, bad payload.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// The queue is at its configured max depth.
    #[error("Queue is full (max depth {0})")]
    QueueFull(usize),

    /// No sender registered for the channel.
    #[error("Unsupported channel: {0}")]
    UnsupportedChannel(Channel),

    /// Any other queue failure (backend, lost lease, corrupt record).
    #[error("Queue error: {0}")]
    Queue(QueueError),

    /// Delivery tracker backend error.
    #[error("Tracker error: {0}")]
    Tracker(String),

    /// Team directory lookup failed.
    #[error("Directory error: {0}")]
    Directory(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NotificationError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            NotificationError::QueueFull(_) => true,
            NotificationError::Queue(err) => err.is_retryable(),
            NotificationError::Tracker(_) | NotificationError::Directory(_) => true,
            _ => false,
        }
    }
}

impl From<QueueError> for NotificationError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InvalidJob(reason) => NotificationError::InvalidJob(reason),
            QueueError::QueueFull(depth) => NotificationError::QueueFull(depth),
            other => NotificationError::Queue(other),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for NotificationError {
    fn from(err: redis::RedisError) -> Self {
        NotificationError::Tracker(err.to_string())
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl From<core_config::ConfigError> for NotificationError {
    fn from(err: core_config::ConfigError) -> Self {
        NotificationError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_queue_errors_map_to_taxonomy() {
        let err: NotificationError = QueueError::InvalidJob("no recipients".into()).into();
        assert!(matches!(err, NotificationError::InvalidJob(ref r) if r == "no recipients"));

        let err: NotificationError = QueueError::QueueFull(10).into();
        assert!(matches!(err, NotificationError::QueueFull(10)));
        assert!(err.is_retryable());

        let err: NotificationError = QueueError::NotInFlight(Uuid::new_v4()).into();
        assert!(matches!(err, NotificationError::Queue(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unsupported_channel_message() {
        let err = NotificationError::UnsupportedChannel(Channel::Push);
        assert_eq!(err.to_string(), "Unsupported channel: push");
    }
}
