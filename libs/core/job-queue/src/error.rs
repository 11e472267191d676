//! Queue error types
//!
//! Enqueue-time rejections (`InvalidJob`, `QueueFull`) are returned to the
//! producer synchronously. Transition errors (`NotInFlight`, `NotFound`)
//! signal a worker acting on a job it no longer owns.

use crate::job::JobId;
use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Malformed enqueue request, never enters the queue
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Max queue depth reached
    #[error("Queue is full (max depth {0})")]
    QueueFull(usize),

    /// Transition attempted on a job that is not currently claimed
    #[error("Job {0} is not in flight")]
    NotInFlight(JobId),

    /// Unknown job id (never enqueued or already pruned)
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Redis connection or command error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored job state could not be interpreted
    #[error("Corrupt job record {id}: {details}")]
    Corrupt { id: String, details: String },
}

impl QueueError {
    /// Whether the producer may try the same enqueue again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::QueueFull(_) => true,
            #[cfg(feature = "redis")]
            QueueError::Redis(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}
