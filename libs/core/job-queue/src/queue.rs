//! The `JobQueue` trait shared by all backends.

use crate::error::QueueResult;
use crate::job::{EnqueueRequest, Job, JobId, JobStatus, QueueJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Trait for job queue backends.
///
/// The queue is the single owner of job state. Every transition is atomic with
/// respect to concurrent callers: no two `claim` calls ever return the same
/// job while its lease is live.
#[async_trait]
pub trait JobQueue<T: QueueJob>: Send + Sync {
    /// Accept a job. Returns the existing id when `dedupe_key` was seen within
    /// the dedupe window.
    async fn enqueue(&self, request: EnqueueRequest<T>) -> QueueResult<JobId>;

    /// Claim the earliest due pending job, ordered by due time then insertion.
    ///
    /// Expired leases are returned to pending first, without an attempt increment.
    async fn claim(&self, worker_id: &str, lease: Duration) -> QueueResult<Option<Job<T>>>;

    /// Push the lease of a job held by `worker_id` out to now + `lease`.
    ///
    /// Returns the new expiry. `NotInFlight` when the caller no longer holds a
    /// live lease on the job.
    async fn extend_lease(&self, id: JobId, worker_id: &str, lease: Duration) -> QueueResult<DateTime<Utc>>;

    /// Mark an in-flight job delivered.
    ///
    /// This and every other transition below require `worker_id` to hold a
    /// live lease on the job; otherwise they fail with `NotInFlight` and
    /// change nothing.
    async fn ack(&self, id: JobId, worker_id: &str) -> QueueResult<()>;

    /// Count a failed attempt and schedule the job again after `backoff`.
    ///
    /// Once `attempt` reaches `max_attempts` the job becomes `FailedPermanent`
    /// instead; this is not an error. Returns the resulting status.
    async fn retry(&self, id: JobId, worker_id: &str, backoff: Duration) -> QueueResult<JobStatus>;

    /// Like `retry`, also replacing the job body for the next attempt.
    async fn retry_with(
        &self,
        id: JobId,
        worker_id: &str,
        backoff: Duration,
        body: T,
    ) -> QueueResult<JobStatus>;

    /// Count a failed attempt and mark the job permanently failed.
    async fn fail(&self, id: JobId, worker_id: &str, reason: &str) -> QueueResult<()>;

    /// Mark the job permanently failed without counting an attempt.
    async fn discard(&self, id: JobId, worker_id: &str, reason: &str) -> QueueResult<()>;

    /// Current snapshot of a job, if still retained.
    async fn get(&self, id: JobId) -> QueueResult<Option<Job<T>>>;

    /// Queue counters.
    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Queue name (metrics label / key prefix).
    fn name(&self) -> &str;
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    /// Jobs that reached `delivered` since the queue was created.
    pub delivered: usize,
    /// Jobs that reached `failed_permanent` since the queue was created.
    pub failed: usize,
}

impl QueueStats {
    /// Jobs counted against the max depth.
    pub fn depth(&self) -> usize {
        self.pending + self.in_flight
    }
}
