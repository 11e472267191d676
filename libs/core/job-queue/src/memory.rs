//! In-memory queue backend.
//!
//! All state sits behind one `tokio::sync::Mutex`, so every operation is a
//! single critical section: a claim is a compare-and-set on status + lease, not
//! a read-then-write. Pending jobs are indexed by `(due_at, seq)` and in-flight
//! jobs by lease expiry, so claim and lease recovery never scan the whole table.

use crate::clock::{Clock, SystemClock, add_duration};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{EnqueueRequest, Job, JobId, JobStatus, Lease, QueueJob};
use crate::metrics;
use crate::queue::{JobQueue, QueueStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Entry<T> {
    job: Job<T>,
    /// Insertion order, kept across retries for FIFO among equal due times.
    seq: u64,
}

struct State<T> {
    entries: HashMap<JobId, Entry<T>>,
    ready: BTreeSet<(DateTime<Utc>, u64, JobId)>,
    leases: BTreeSet<(DateTime<Utc>, JobId)>,
    dedupe: HashMap<String, (JobId, DateTime<Utc>)>,
    dedupe_expiry: VecDeque<(DateTime<Utc>, String)>,
    finished: VecDeque<(DateTime<Utc>, JobId)>,
    next_seq: u64,
    delivered: usize,
    failed: usize,
}

impl<T> State<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ready: BTreeSet::new(),
            leases: BTreeSet::new(),
            dedupe: HashMap::new(),
            dedupe_expiry: VecDeque::new(),
            finished: VecDeque::new(),
            next_seq: 0,
            delivered: 0,
            failed: 0,
        }
    }

    fn depth(&self) -> usize {
        self.ready.len() + self.leases.len()
    }

    /// Return every job whose lease ran out to pending. No attempt increment.
    fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut recovered = 0;
        while let Some(&(expires_at, id)) = self.leases.first() {
            if expires_at > now {
                break;
            }
            self.leases.pop_first();
            if let Some(entry) = self.entries.get_mut(&id) {
                let worker = entry.job.lease.take().map(|l| l.worker_id);
                entry.job.status = JobStatus::Pending;
                entry.job.updated_at = now;
                self.ready.insert((entry.job.due_at(), entry.seq, id));
                debug!(job_id = %id, worker_id = ?worker, "Lease expired, job returned to pending");
                recovered += 1;
            }
        }
        recovered
    }

    /// Drop expired dedupe keys and terminal jobs past retention.
    fn prune(&mut self, now: DateTime<Utc>, retention: Duration) {
        while let Some((expires_at, _)) = self.dedupe_expiry.front() {
            if *expires_at > now {
                break;
            }
            if let Some((_, key)) = self.dedupe_expiry.pop_front()
                && self.dedupe.get(&key).is_some_and(|(_, e)| *e <= now)
            {
                self.dedupe.remove(&key);
            }
        }

        while let Some(&(finished_at, id)) = self.finished.front() {
            if add_duration(finished_at, retention) > now {
                break;
            }
            self.finished.pop_front();
            self.entries.remove(&id);
        }
    }

    /// Expiry of the live lease `worker_id` holds on the job.
    ///
    /// An expired lease that no claim has swept yet is not live.
    fn held_lease(&self, id: JobId, worker_id: &str, now: DateTime<Utc>) -> QueueResult<DateTime<Utc>> {
        let entry = self.entries.get(&id).ok_or(QueueError::NotFound(id))?;
        match &entry.job.lease {
            Some(lease)
                if entry.job.status == JobStatus::InFlight
                    && lease.worker_id == worker_id
                    && lease.expires_at > now =>
            {
                Ok(lease.expires_at)
            }
            lease => {
                debug!(
                    job_id = %id,
                    worker_id = %worker_id,
                    status = %entry.job.status,
                    holder = ?lease.as_ref().map(|l| l.worker_id.as_str()),
                    "Transition refused, caller does not hold the lease"
                );
                Err(QueueError::NotInFlight(id))
            }
        }
    }

    /// Take the job out of the lease index. Fails unless `worker_id` holds a
    /// live lease on it.
    fn release_lease(&mut self, id: JobId, worker_id: &str, now: DateTime<Utc>) -> QueueResult<&mut Entry<T>> {
        let expires_at = self.held_lease(id, worker_id, now)?;
        self.leases.remove(&(expires_at, id));
        let entry = self.entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        entry.job.lease = None;
        Ok(entry)
    }

    fn extend(&mut self, id: JobId, worker_id: &str, lease: Duration, now: DateTime<Utc>) -> QueueResult<DateTime<Utc>> {
        let previous = self.held_lease(id, worker_id, now)?;
        let expires_at = add_duration(now, lease);
        self.leases.remove(&(previous, id));
        self.leases.insert((expires_at, id));
        let entry = self.entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        entry.job.lease = Some(Lease {
            worker_id: worker_id.to_string(),
            expires_at,
        });
        entry.job.updated_at = now;
        Ok(expires_at)
    }

    fn finish(
        &mut self,
        id: JobId,
        worker_id: &str,
        status: JobStatus,
        reason: Option<String>,
        count_attempt: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let entry = self.release_lease(id, worker_id, now)?;
        if count_attempt {
            entry.job.attempt = entry.job.attempt.saturating_add(1);
        }
        entry.job.status = status;
        entry.job.failure_reason = reason;
        entry.job.updated_at = now;

        match status {
            JobStatus::Delivered => self.delivered += 1,
            _ => self.failed += 1,
        }
        self.finished.push_back((now, id));
        Ok(())
    }

    fn reschedule(
        &mut self,
        id: JobId,
        worker_id: &str,
        backoff: Duration,
        body: Option<T>,
        now: DateTime<Utc>,
    ) -> QueueResult<JobStatus> {
        let entry = self.release_lease(id, worker_id, now)?;
        entry.job.attempt = entry.job.attempt.saturating_add(1);
        entry.job.updated_at = now;
        if let Some(body) = body {
            entry.job.body = body;
        }

        if entry.job.attempt >= entry.job.max_attempts {
            entry.job.status = JobStatus::FailedPermanent;
            entry.job.failure_reason =
                Some(format!("max attempts ({}) exhausted", entry.job.max_attempts));
            self.failed += 1;
            self.finished.push_back((now, id));
            return Ok(JobStatus::FailedPermanent);
        }

        let due = add_duration(now, backoff);
        entry.job.status = JobStatus::Pending;
        entry.job.not_before = Some(due);
        let seq = entry.seq;
        self.ready.insert((due, seq, id));
        Ok(JobStatus::Pending)
    }
}

/// Single-process queue backend.
pub struct MemoryJobQueue<T> {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State<T>>,
}

impl<T: QueueJob> MemoryJobQueue<T> {
    /// Create a queue on the system clock.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a queue on an explicit clock.
    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            queue = %config.name,
            max_depth = config.max_depth,
            dedupe_window_secs = config.dedupe_window.as_secs(),
            "Created in-memory job queue"
        );
        Self {
            config,
            clock,
            state: Mutex::new(State::new()),
        }
    }

    /// Get the queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn publish_depth(&self, state: &State<T>) {
        metrics::set_queue_depth(&self.config.name, state.ready.len(), state.leases.len());
    }

    fn resolved(&self, id: JobId, status: JobStatus) {
        metrics::record_resolved(&self.config.name, status.as_ref());
        debug!(queue = %self.config.name, job_id = %id, status = %status, "Job resolved");
    }
}

#[async_trait]
impl<T: QueueJob> JobQueue<T> for MemoryJobQueue<T> {
    async fn enqueue(&self, request: EnqueueRequest<T>) -> QueueResult<JobId> {
        if let Err(reason) = request.validate() {
            metrics::record_rejected(&self.config.name, "invalid");
            warn!(queue = %self.config.name, reason = %reason, "Rejected invalid job");
            return Err(QueueError::InvalidJob(reason));
        }

        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.prune(now, self.config.retention);

        if let Some(key) = &request.dedupe_key
            && let Some((existing, expires_at)) = state.dedupe.get(key)
            && *expires_at > now
        {
            metrics::record_deduplicated(&self.config.name);
            debug!(queue = %self.config.name, job_id = %existing, dedupe_key = %key, "Duplicate enqueue collapsed");
            return Ok(*existing);
        }

        if self.config.is_bounded() && state.depth() >= self.config.max_depth {
            metrics::record_rejected(&self.config.name, "full");
            warn!(queue = %self.config.name, max_depth = self.config.max_depth, "Queue full, rejecting job");
            return Err(QueueError::QueueFull(self.config.max_depth));
        }

        let id = Uuid::new_v4();
        let seq = state.next_seq;
        state.next_seq += 1;

        let job = Job {
            id,
            body: request.body,
            attempt: 0,
            max_attempts: request.max_attempts,
            not_before: request.not_before,
            status: JobStatus::Pending,
            enqueued_at: now,
            updated_at: now,
            lease: None,
            dedupe_key: request.dedupe_key.clone(),
            failure_reason: None,
        };
        state.ready.insert((job.due_at(), seq, id));
        state.entries.insert(id, Entry { job, seq });

        if let Some(key) = request.dedupe_key {
            let expires_at = add_duration(now, self.config.dedupe_window);
            state.dedupe.insert(key.clone(), (id, expires_at));
            state.dedupe_expiry.push_back((expires_at, key));
        }

        metrics::record_enqueued(&self.config.name);
        self.publish_depth(state);
        debug!(queue = %self.config.name, job_id = %id, not_before = ?request.not_before, "Enqueued job");
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> QueueResult<Option<Job<T>>> {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let expired = state.sweep_expired(now);
        metrics::record_leases_expired(&self.config.name, expired);
        state.prune(now, self.config.retention);

        let Some(&(due_at, seq, id)) = state.ready.first() else {
            return Ok(None);
        };
        if due_at > now {
            return Ok(None);
        }
        state.ready.remove(&(due_at, seq, id));

        let expires_at = add_duration(now, lease);
        let entry = state.entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        entry.job.status = JobStatus::InFlight;
        entry.job.updated_at = now;
        entry.job.lease = Some(Lease {
            worker_id: worker_id.to_string(),
            expires_at,
        });
        let claimed = entry.job.clone();
        state.leases.insert((expires_at, id));

        metrics::record_claimed(&self.config.name);
        self.publish_depth(state);
        debug!(
            queue = %self.config.name,
            job_id = %id,
            worker_id = %worker_id,
            attempt = claimed.attempt,
            "Claimed job"
        );
        Ok(Some(claimed))
    }

    async fn extend_lease(&self, id: JobId, worker_id: &str, lease: Duration) -> QueueResult<DateTime<Utc>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let expires_at = state.extend(id, worker_id, lease, now)?;
        debug!(queue = %self.config.name, job_id = %id, worker_id = %worker_id, expires_at = %expires_at, "Lease extended");
        Ok(expires_at)
    }

    async fn ack(&self, id: JobId, worker_id: &str) -> QueueResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.finish(id, worker_id, JobStatus::Delivered, None, true, now)?;
        self.publish_depth(&state);
        self.resolved(id, JobStatus::Delivered);
        Ok(())
    }

    async fn retry(&self, id: JobId, worker_id: &str, backoff: Duration) -> QueueResult<JobStatus> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let status = state.reschedule(id, worker_id, backoff, None, now)?;
        self.publish_depth(&state);
        self.resolved(id, status);
        Ok(status)
    }

    async fn retry_with(
        &self,
        id: JobId,
        worker_id: &str,
        backoff: Duration,
        body: T,
    ) -> QueueResult<JobStatus> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let status = state.reschedule(id, worker_id, backoff, Some(body), now)?;
        self.publish_depth(&state);
        self.resolved(id, status);
        Ok(status)
    }

    async fn fail(&self, id: JobId, worker_id: &str, reason: &str) -> QueueResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.finish(id, worker_id, JobStatus::FailedPermanent, Some(reason.to_string()), true, now)?;
        self.publish_depth(&state);
        self.resolved(id, JobStatus::FailedPermanent);
        Ok(())
    }

    async fn discard(&self, id: JobId, worker_id: &str, reason: &str) -> QueueResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.finish(id, worker_id, JobStatus::FailedPermanent, Some(reason.to_string()), false, now)?;
        self.publish_depth(&state);
        self.resolved(id, JobStatus::FailedPermanent);
        Ok(())
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job<T>>> {
        let state = self.state.lock().await;
        Ok(state.entries.get(&id).map(|entry| entry.job.clone()))
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            pending: state.ready.len(),
            in_flight: state.leases.len(),
            delivered: state.delivered,
            failed: state.failed,
        })
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

    const LEASE: Duration = Duration::from_secs(30);

    fn job(target: &str) -> EnqueueRequest<TestJob> {
        EnqueueRequest::new(TestJob {
            target: target.to_string(),
        })
    }

    fn queue_with_clock(config: QueueConfig) -> (MemoryJobQueue<TestJob>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (MemoryJobQueue::with_clock(config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_invalid_job_rejected() {
        let queue = MemoryJobQueue::new(QueueConfig::default());
        let err = queue.enqueue(job("")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidJob(reason) if reason == "target is empty"));
        assert_eq!(queue.stats().await.unwrap().depth(), 0);
    }

    #[tokio::test]
    async fn test_fifo_within_equal_due_time() {
        let (queue, _clock) = queue_with_clock(QueueConfig::default());
        let first = queue.enqueue(job("a")).await.unwrap();
        let second = queue.enqueue(job("b")).await.unwrap();

        let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::InFlight);
        assert_eq!(claimed.lease.as_ref().unwrap().worker_id, "w1");

        let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, second);
        assert!(queue.claim("w1", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scheduled_job_not_claimable_until_due() {
        let (queue, clock) = queue_with_clock(QueueConfig::default());
        let at = add_duration(clock.now(), Duration::from_secs(600));
        let id = queue.enqueue(job("later").not_before(at)).await.unwrap();

        assert!(queue.claim("w1", LEASE).await.unwrap().is_none());

        clock.advance(Duration::from_secs(599));
        assert!(queue.claim("w1", LEASE).await.unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
    }

    #[tokio::test]
    async fn test_dedupe_within_window() {
        let config = QueueConfig::default().with_dedupe_window(Duration::from_secs(60));
        let (queue, clock) = queue_with_clock(config);

        let first = queue.enqueue(job("a").with_dedupe_key("order-1")).await.unwrap();
        let again = queue.enqueue(job("a").with_dedupe_key("order-1")).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(queue.stats().await.unwrap().pending, 1);

        clock.advance(Duration::from_secs(61));
        let later = queue.enqueue(job("a").with_dedupe_key("order-1")).await.unwrap();
        assert_ne!(first, later);
        assert_eq!(queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let (queue, _clock) = queue_with_clock(QueueConfig::default().with_max_depth(2));
        queue.enqueue(job("a")).await.unwrap();
        queue.enqueue(job("b")).await.unwrap();

        let err = queue.enqueue(job("c")).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueFull(2)));

        // In-flight jobs still count against depth; terminal ones do not
        let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        assert!(queue.enqueue(job("c")).await.is_err());
        queue.ack(claimed.id, "w1").await.unwrap();
        assert!(queue.enqueue(job("c")).await.is_ok());
    }

    #[tokio::test]
    async fn test_ack_requires_in_flight() {
        let (queue, _clock) = queue_with_clock(QueueConfig::default());
        let id = queue.enqueue(job("a")).await.unwrap();

        assert!(matches!(queue.ack(id, "w1").await, Err(QueueError::NotInFlight(_))));

        queue.claim("w1", LEASE).await.unwrap().unwrap();
        queue.ack(id, "w1").await.unwrap();
        assert!(matches!(queue.ack(id, "w1").await, Err(QueueError::NotInFlight(_))));

        let stored = queue.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Delivered);
        assert_eq!(stored.attempt, 1);
        assert!(stored.lease.is_none());

        assert!(matches!(
            queue.ack(Uuid::new_v4(), "w1").await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_until_exhausted() {
        let (queue, clock) = queue_with_clock(QueueConfig::default());
        let id = queue.enqueue(job("a").with_max_attempts(3)).await.unwrap();
        let backoff = Duration::from_secs(5);

        for expected_attempt in 1..=2 {
            let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
            assert_eq!(claimed.attempt, expected_attempt - 1);
            let status = queue.retry(id, "w1", backoff).await.unwrap();
            assert_eq!(status, JobStatus::Pending);

            let stored = queue.get(id).await.unwrap().unwrap();
            assert_eq!(stored.attempt, expected_attempt);

            // Backoff hides the job until it elapses
            assert!(queue.claim("w1", LEASE).await.unwrap().is_none());
            clock.advance(backoff);
        }

        queue.claim("w1", LEASE).await.unwrap().unwrap();
        let status = queue.retry(id, "w1", backoff).await.unwrap();
        assert_eq!(status, JobStatus::FailedPermanent);

        let stored = queue.get(id).await.unwrap().unwrap();
        assert_eq!(stored.attempt, 3);
        assert!(stored.failure_reason.unwrap().contains("max attempts"));

        clock.advance(backoff);
        assert!(queue.claim("w1", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_with_replaces_body() {
        let (queue, clock) = queue_with_clock(QueueConfig::default());
        let id = queue.enqueue(job("a")).await.unwrap();
        queue.claim("w1", LEASE).await.unwrap().unwrap();

        let narrowed = TestJob {
            target: "b".to_string(),
        };
        queue.retry_with(id, "w1", Duration::ZERO, narrowed.clone()).await.unwrap();
        clock.advance(Duration::from_millis(1));

        let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.body, narrowed);
        assert_eq!(claimed.attempt, 1);
    }

    #[tokio::test]
    async fn test_lease_expiry_returns_job_without_attempt() {
        let (queue, clock) = queue_with_clock(QueueConfig::default());
        let id = queue.enqueue(job("a")).await.unwrap();

        for worker in ["w1", "w2", "w3"] {
            let claimed = queue.claim(worker, LEASE).await.unwrap().unwrap();
            assert_eq!(claimed.id, id);
            assert_eq!(claimed.attempt, 0);
            assert_eq!(claimed.lease.unwrap().worker_id, worker);

            // Still leased: nobody else gets it
            assert!(queue.claim("other", LEASE).await.unwrap().is_none());
            clock.advance(LEASE);
        }

        let claimed = queue.claim("w4", LEASE).await.unwrap().unwrap();
        queue.ack(claimed.id, "w4").await.unwrap();
        assert_eq!(queue.get(id).await.unwrap().unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_resolve_reclaimed_job() {
        let (queue, clock) = queue_with_clock(QueueConfig::default());
        let id = queue.enqueue(job("a")).await.unwrap();

        queue.claim("w1", Duration::from_secs(1)).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(2));
        let reclaimed = queue.claim("w2", LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);

        // w1's lease is gone: none of its transitions land
        assert!(matches!(queue.ack(id, "w1").await, Err(QueueError::NotInFlight(_))));
        assert!(matches!(
            queue.retry(id, "w1", Duration::ZERO).await,
            Err(QueueError::NotInFlight(_))
        ));
        assert!(matches!(queue.fail(id, "w1", "late").await, Err(QueueError::NotInFlight(_))));
        assert!(matches!(
            queue.extend_lease(id, "w1", LEASE).await,
            Err(QueueError::NotInFlight(_))
        ));

        let stored = queue.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::InFlight);
        assert_eq!(stored.attempt, 0);
        assert_eq!(stored.lease.unwrap().worker_id, "w2");

        // The live holder still resolves it
        assert_eq!(queue.retry(id, "w2", Duration::ZERO).await.unwrap(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_expired_unswept_lease_is_not_held() {
        let (queue, clock) = queue_with_clock(QueueConfig::default());
        let id = queue.enqueue(job("a")).await.unwrap();
        queue.claim("w1", Duration::from_secs(1)).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(1));
        assert!(matches!(queue.ack(id, "w1").await, Err(QueueError::NotInFlight(_))));

        // The next claim sweeps it back and hands it out again
        let reclaimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        queue.ack(id, "w1").await.unwrap();
    }

    #[tokio::test]
    async fn test_extend_lease_keeps_job_reserved() {
        let (queue, clock) = queue_with_clock(QueueConfig::default());
        let id = queue.enqueue(job("a")).await.unwrap();
        queue.claim("w1", Duration::from_secs(10)).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(8));
        let expires_at = queue.extend_lease(id, "w1", Duration::from_secs(10)).await.unwrap();
        assert_eq!(expires_at, add_duration(clock.now(), Duration::from_secs(10)));

        // Past the original expiry, still held
        clock.advance(Duration::from_secs(8));
        assert!(queue.claim("w2", LEASE).await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().in_flight, 1);
        queue.ack(id, "w1").await.unwrap();

        assert!(matches!(
            queue.extend_lease(id, "w1", LEASE).await,
            Err(QueueError::NotInFlight(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_and_discard() {
        let (queue, _clock) = queue_with_clock(QueueConfig::default());
        let failed = queue.enqueue(job("a")).await.unwrap();
        let discarded = queue.enqueue(job("b")).await.unwrap();
        queue.claim("w1", LEASE).await.unwrap().unwrap();
        queue.claim("w1", LEASE).await.unwrap().unwrap();

        queue.fail(failed, "w1", "invalid address").await.unwrap();
        queue.discard(discarded, "w1", "unsupported channel").await.unwrap();

        let failed = queue.get(failed).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::FailedPermanent);
        assert_eq!(failed.attempt, 1);

        let discarded = queue.get(discarded).await.unwrap().unwrap();
        assert_eq!(discarded.status, JobStatus::FailedPermanent);
        assert_eq!(discarded.attempt, 0);
        assert_eq!(discarded.failure_reason.as_deref(), Some("unsupported channel"));

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.depth(), 0);
    }

    #[tokio::test]
    async fn test_terminal_jobs_pruned_after_retention() {
        let config = QueueConfig::default().with_retention(Duration::from_secs(60));
        let (queue, clock) = queue_with_clock(config);
        let id = queue.enqueue(job("a")).await.unwrap();
        queue.claim("w1", LEASE).await.unwrap().unwrap();
        queue.ack(id, "w1").await.unwrap();

        clock.advance(Duration::from_secs(61));
        assert!(queue.claim("w1", LEASE).await.unwrap().is_none());
        assert!(queue.get(id).await.unwrap().is_none());
        // Counters are cumulative and survive pruning
        assert_eq!(queue.stats().await.unwrap().delivered, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let queue = Arc::new(MemoryJobQueue::new(QueueConfig::default()));
        for i in 0..200 {
            queue.enqueue(job(&format!("job-{}", i))).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let worker = format!("w{}", w);
                let mut claimed = Vec::new();
                while let Some(job) = queue.claim(&worker, LEASE).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {} claimed twice", id);
            }
        }
        assert_eq!(seen.len(), 200);
    }
}
