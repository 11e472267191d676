//! Delivery tracker: append-only attempt log plus status snapshots.
//!
//! The dispatcher is the only writer. Each attempt is keyed by job id and
//! 1-based attempt number; a fan-out round produces one record per recipient
//! under the same attempt number.

use crate::channels::{Outcome, OutcomeKind};
use crate::error::NotificationResult;
use crate::models::{Channel, NotificationJob, Recipient};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use job_queue::{Clock, JobId, JobQueue, JobStatus, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Immutable record of one sender invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub job_id: JobId,
    /// 1-based; all sends of one round share it.
    pub attempt_number: u32,
    pub recipient: Recipient,
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub outcome: OutcomeKind,
    /// Present only on error outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub duration_ms: u64,
}

impl DeliveryAttempt {
    pub fn new(
        job_id: JobId,
        attempt_number: u32,
        recipient: Recipient,
        channel: Channel,
        outcome: &Outcome,
        timestamp: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            job_id,
            attempt_number,
            recipient,
            channel,
            timestamp,
            outcome: outcome.kind(),
            error_detail: outcome.detail().map(str::to_string),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Ordered, restartable view over a job's attempts.
///
/// `iter()` may be called any number of times; each call starts from the
/// first attempt.
#[derive(Debug, Clone, Default)]
pub struct History {
    attempts: Arc<[DeliveryAttempt]>,
}

impl History {
    /// Order by attempt number. The sort is stable, so records within one
    /// round keep their append order.
    fn from_log(mut attempts: Vec<DeliveryAttempt>) -> Self {
        attempts.sort_by_key(|a| a.attempt_number);
        Self {
            attempts: attempts.into(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DeliveryAttempt> {
        self.attempts.iter()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn last(&self) -> Option<&DeliveryAttempt> {
        self.attempts.last()
    }

    /// Attempts of a single round.
    pub fn round(&self, attempt_number: u32) -> impl Iterator<Item = &DeliveryAttempt> {
        self.iter().filter(move |a| a.attempt_number == attempt_number)
    }

    pub fn to_vec(&self) -> Vec<DeliveryAttempt> {
        self.attempts.to_vec()
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a DeliveryAttempt;
    type IntoIter = std::slice::Iter<'a, DeliveryAttempt>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Queue state combined with the most recent attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub job_id: JobId,
    /// `None` once the queue has pruned the job; the attempt log outlives it.
    pub status: Option<JobStatus>,
    pub channel: Option<Channel>,
    pub attempt: Option<u32>,
    pub max_attempts: Option<u32>,
    pub not_before: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub latest_attempt: Option<DeliveryAttempt>,
    pub attempts_recorded: usize,
}

/// Trait for attempt log storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Append one record. Never overwrites.
    async fn append(&self, attempt: &DeliveryAttempt) -> NotificationResult<()>;

    /// All records for a job, in append order.
    async fn load(&self, job_id: JobId) -> NotificationResult<Vec<DeliveryAttempt>>;
}

const DEFAULT_RETENTION: Duration = Duration::from_secs(86_400);

#[derive(Default)]
struct MemoryLog {
    entries: HashMap<JobId, JobLog>,
    /// Expiry candidates in append order. A job appended again is pushed
    /// again; the stale entry is skipped when it reaches the front.
    expiry: VecDeque<(DateTime<Utc>, JobId)>,
}

struct JobLog {
    attempts: Vec<DeliveryAttempt>,
    expires_at: DateTime<Utc>,
}

impl MemoryLog {
    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(&(expires_at, job_id)) = self.expiry.front() {
            if expires_at > now {
                break;
            }
            self.expiry.pop_front();
            if self.entries.get(&job_id).is_some_and(|log| log.expires_at <= now) {
                self.entries.remove(&job_id);
            }
        }
    }
}

/// Process-local attempt log.
///
/// A job's records are dropped once `retention` passes without a new append,
/// matching the per-job `EXPIRE` of the Redis store.
pub struct MemoryAttemptStore {
    log: RwLock<MemoryLog>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryAttemptStore {
    fn default() -> Self {
        Self {
            log: RwLock::new(MemoryLog::default()),
            retention: DEFAULT_RETENTION,
            clock: Arc::new(SystemClock),
        }
    }
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_add_signed(retention))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Jobs with records still retained.
    pub async fn job_count(&self) -> usize {
        let now = self.clock.now();
        self.log
            .read()
            .await
            .entries
            .values()
            .filter(|log| log.expires_at > now)
            .count()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn append(&self, attempt: &DeliveryAttempt) -> NotificationResult<()> {
        let now = self.clock.now();
        let expires_at = self.expiry_from(now);
        let mut guard = self.log.write().await;
        let log = &mut *guard;
        log.prune(now);

        let entry = log.entries.entry(attempt.job_id).or_insert_with(|| JobLog {
            attempts: Vec::new(),
            expires_at,
        });
        entry.attempts.push(attempt.clone());
        entry.expires_at = expires_at;
        log.expiry.push_back((expires_at, attempt.job_id));
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> NotificationResult<Vec<DeliveryAttempt>> {
        let now = self.clock.now();
        Ok(self
            .log
            .read()
            .await
            .entries
            .get(&job_id)
            .filter(|log| log.expires_at > now)
            .map(|log| log.attempts.clone())
            .unwrap_or_default())
    }
}

#[cfg(feature = "redis")]
pub use redis_store::RedisAttemptStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::{AttemptStore, DeliveryAttempt};
    use crate::error::NotificationResult;
    use async_trait::async_trait;
    use job_queue::JobId;
    use redis::aio::ConnectionManager;
    use std::sync::Arc;
    use std::time::Duration;

    /// Attempt log as one Redis list per job (`RPUSH` / `LRANGE`).
    pub struct RedisAttemptStore {
        redis: Arc<ConnectionManager>,
        prefix: String,
        retention: Duration,
    }

    impl RedisAttemptStore {
        /// `retention` bounds how long a job's log lives after its last append.
        pub fn new(redis: ConnectionManager, queue_name: &str, retention: Duration) -> Self {
            Self {
                redis: Arc::new(redis),
                prefix: format!("jobq:{{{}}}:attempts", queue_name),
                retention,
            }
        }

        fn key(&self, job_id: JobId) -> String {
            format!("{}:{}", self.prefix, job_id)
        }
    }

    #[async_trait]
    impl AttemptStore for RedisAttemptStore {
        async fn append(&self, attempt: &DeliveryAttempt) -> NotificationResult<()> {
            let mut conn = (*self.redis).clone();
            let key = self.key(attempt.job_id);
            let record = serde_json::to_string(attempt)?;
            let retention_secs = self.retention.as_secs().max(1);

            let _: () = redis::pipe()
                .atomic()
                .cmd("RPUSH")
                .arg(&key)
                .arg(record)
                .ignore()
                .cmd("EXPIRE")
                .arg(&key)
                .arg(retention_secs)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        }

        async fn load(&self, job_id: JobId) -> NotificationResult<Vec<DeliveryAttempt>> {
            let mut conn = (*self.redis).clone();
            let records: Vec<String> = redis::cmd("LRANGE")
                .arg(self.key(job_id))
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;

            records
                .iter()
                .map(|raw| serde_json::from_str(raw).map_err(Into::into))
                .collect()
        }
    }
}

/// Attempt log facade joined with queue state for status reads.
pub struct DeliveryTracker {
    store: Arc<dyn AttemptStore>,
    queue: Arc<dyn JobQueue<NotificationJob>>,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn AttemptStore>, queue: Arc<dyn JobQueue<NotificationJob>>) -> Self {
        Self { store, queue }
    }

    /// Append an attempt.
    pub async fn record(&self, attempt: DeliveryAttempt) -> NotificationResult<()> {
        self.store.append(&attempt).await
    }

    /// Attempts ordered by attempt number.
    pub async fn history(&self, job_id: JobId) -> NotificationResult<History> {
        Ok(History::from_log(self.store.load(job_id).await?))
    }

    /// Queue state plus latest attempt. `None` when neither knows the job.
    pub async fn latest_status(&self, job_id: JobId) -> NotificationResult<Option<StatusSnapshot>> {
        let job = self.queue.get(job_id).await?;
        let history = self.history(job_id).await?;

        if job.is_none() && history.is_empty() {
            return Ok(None);
        }

        Ok(Some(StatusSnapshot {
            job_id,
            status: job.as_ref().map(|j| j.status),
            channel: job
                .as_ref()
                .map(|j| j.body.channel())
                .or_else(|| history.last().map(|a| a.channel)),
            attempt: job.as_ref().map(|j| j.attempt),
            max_attempts: job.as_ref().map(|j| j.max_attempts),
            not_before: job.as_ref().and_then(|j| j.not_before),
            failure_reason: job.as_ref().and_then(|j| j.failure_reason.clone()),
            updated_at: job.as_ref().map(|j| j.updated_at),
            latest_attempt: history.last().cloned(),
            attempts_recorded: history.len(),
        }))
    }

    /// Recipients already sent in a round, for skipping on replay.
    pub async fn sent_recipients(
        &self,
        job_id: JobId,
        attempt_number: u32,
    ) -> NotificationResult<HashSet<Recipient>> {
        Ok(self
            .store
            .load(job_id)
            .await?
            .into_iter()
            .filter(|a| a.attempt_number == attempt_number && a.outcome == OutcomeKind::Sent)
            .map(|a| a.recipient)
            .collect())
    }
}
