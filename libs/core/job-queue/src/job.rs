//! Job envelope and queue-owned job state.
//!
//! This module provides:
//! - `QueueJob` trait for job bodies
//! - `EnqueueRequest` for producers
//! - `Job` envelope carrying queue-owned state (status, attempt, lease)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Queue-assigned job identifier, stable across retries.
pub type JobId = Uuid;

/// Trait for job bodies.
///
/// The queue treats the body as opaque apart from validating it at enqueue
/// time. A body that fails validation is rejected with `InvalidJob` and never
/// enters the queue.
///
/// # Example
///
/// ```rust,ignore
/// use job_queue::QueueJob;
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct PingJob {
///     target: String,
/// }
///
/// impl QueueJob for PingJob {
///     fn validate(&self) -> Result<(), String> {
///         if self.target.is_empty() {
///             return Err("target is empty".into());
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait QueueJob: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Check the body is well-formed. The error string is the rejection reason.
    fn validate(&self) -> Result<(), String>;
}

/// Job status as owned by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed (possibly not yet due).
    Pending,
    /// Claimed by a worker under a lease.
    InFlight,
    /// Terminal: delivered.
    Delivered,
    /// Terminal: will never be attempted again.
    FailedPermanent,
}

impl JobStatus {
    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Delivered | JobStatus::FailedPermanent)
    }
}

/// Claim reservation held by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// A job together with its queue-owned state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<T> {
    pub id: JobId,
    pub body: T,
    /// Delivery attempts made so far.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Earliest claim time; `None` for immediate jobs.
    pub not_before: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease: Option<Lease>,
    pub dedupe_key: Option<String>,
    pub failure_reason: Option<String>,
}

impl<T> Job<T> {
    /// When the job becomes claimable.
    pub fn due_at(&self) -> DateTime<Utc> {
        self.not_before.unwrap_or(self.enqueued_at)
    }

    /// Whether a pending job may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at() <= now
    }

    /// Whether an in-flight job's lease has run out at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| lease.expires_at <= now)
    }

    /// Attempts left before the job fails permanently.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }
}

/// A producer's request to enqueue a job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest<T> {
    pub body: T,
    pub max_attempts: u32,
    pub not_before: Option<DateTime<Utc>>,
    pub dedupe_key: Option<String>,
}

impl<T: QueueJob> EnqueueRequest<T> {
    /// Immediate job with a default ceiling of 3 attempts.
    pub fn new(body: T) -> Self {
        Self {
            body,
            max_attempts: 3,
            not_before: None,
            dedupe_key: None,
        }
    }

    /// Set the retry ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay the job until `at`.
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Attach an idempotency key.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Shared enqueue-time validation for all backends.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.dedupe_key.as_deref().is_some_and(str::is_empty) {
            return Err("dedupe key must not be empty".to_string());
        }
        self.body.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestJob {
        target: String,
    }

    impl QueueJob for TestJob {
        fn validate(&self) -> Result<(), String> {
            if self.target.is_empty() {
                return Err("target is empty".into());
            }
            Ok(())
        }
    }

    fn job(not_before: Option<DateTime<Utc>>) -> Job<TestJob> {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            body: TestJob { target: "a".into() },
            attempt: 0,
            max_attempts: 3,
            not_before,
            status: JobStatus::Pending,
            enqueued_at: now,
            updated_at: now,
            lease: None,
            dedupe_key: None,
            failure_reason: None,
        }
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(JobStatus::InFlight.to_string(), "in_flight");
        assert_eq!(JobStatus::FailedPermanent.as_ref(), "failed_permanent");
        let parsed: JobStatus = "delivered".parse().unwrap();
        assert_eq!(parsed, JobStatus::Delivered);
        assert!(parsed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn test_due_time() {
        let immediate = job(None);
        assert!(immediate.is_due(Utc::now()));

        let later = Utc::now() + TimeDelta::minutes(10);
        let scheduled = job(Some(later));
        assert!(!scheduled.is_due(Utc::now()));
        assert!(scheduled.is_due(later));
    }

    #[test]
    fn test_request_validation() {
        let ok = EnqueueRequest::new(TestJob { target: "a".into() });
        assert!(ok.validate().is_ok());

        let zero = EnqueueRequest::new(TestJob { target: "a".into() }).with_max_attempts(0);
        assert!(zero.validate().is_err());

        let empty = EnqueueRequest::new(TestJob { target: String::new() });
        assert_eq!(empty.validate().unwrap_err(), "target is empty");
    }
}
