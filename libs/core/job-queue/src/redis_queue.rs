//! Redis queue backend.
//!
//! Layout (all keys share the `jobq:{<name>}` hash tag so they land in one slot):
//!
//! - `jobq:{name}:job:<id>`: hash with the job record
//! - `jobq:{name}:pending`: sorted set, score = due time (ms), member = `<seq:020>:<id>`
//! - `jobq:{name}:inflight`: sorted set, score = lease expiry (ms), same members
//! - `jobq:{name}:seq`: insertion counter
//! - `jobq:{name}:delivered`, `jobq:{name}:failed_permanent`: terminal transition counters
//! - `jobq:{name}:dedupe:<key>`: job id, expiring after the dedupe window
//!
//! The zero-padded sequence prefix breaks score ties in insertion order. Every
//! state transition runs as one Lua script, so concurrent workers in separate
//! processes never observe a half-applied transition.

use crate::clock::{Clock, SystemClock, add_duration};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{EnqueueRequest, Job, JobId, JobStatus, Lease, QueueJob};
use crate::metrics;
use crate::queue::{JobQueue, QueueStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ENQUEUE_SCRIPT: &str = r"
if ARGV[7] ~= '' then
    local existing = redis.call('GET', KEYS[5])
    if existing then
        return {'dup', existing}
    end
end
local max_depth = tonumber(ARGV[9])
if max_depth > 0 and (redis.call('ZCARD', KEYS[2]) + redis.call('ZCARD', KEYS[3])) >= max_depth then
    return {'full', ''}
end
local seq = redis.call('INCR', KEYS[4])
local member = string.format('%020d', seq) .. ':' .. ARGV[1]
redis.call('HSET', KEYS[1],
    'body', ARGV[2], 'status', 'pending', 'attempt', '0', 'max_attempts', ARGV[3],
    'not_before', ARGV[4], 'due_at', ARGV[5], 'enqueued_at', ARGV[6], 'updated_at', ARGV[6],
    'member', member, 'dedupe_key', ARGV[7],
    'lease_worker', '', 'lease_expires', '', 'failure_reason', '')
redis.call('ZADD', KEYS[2], ARGV[5], member)
if ARGV[7] ~= '' then
    redis.call('SET', KEYS[5], ARGV[1], 'PX', ARGV[8])
end
return {'ok', ARGV[1]}
";

const CLAIM_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, member in ipairs(expired) do
    redis.call('ZREM', KEYS[2], member)
    local key = ARGV[4] .. ':job:' .. string.sub(member, 22)
    local due = redis.call('HGET', key, 'due_at')
    if due then
        redis.call('HSET', key, 'status', 'pending', 'lease_worker', '', 'lease_expires', '', 'updated_at', ARGV[1])
        redis.call('ZADD', KEYS[1], due, member)
    end
end
local ready = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, 1)
if #ready == 0 then
    return {tostring(#expired), ''}
end
local member = ready[1]
local id = string.sub(member, 22)
redis.call('ZREM', KEYS[1], member)
redis.call('ZADD', KEYS[2], ARGV[2], member)
redis.call('HSET', ARGV[4] .. ':job:' .. id,
    'status', 'in_flight', 'lease_worker', ARGV[3], 'lease_expires', ARGV[2], 'updated_at', ARGV[1])
return {tostring(#expired), id}
";

const TRANSITION_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 'missing'
end
local job = redis.call('HMGET', KEYS[1], 'status', 'attempt', 'max_attempts', 'member', 'lease_worker', 'lease_expires')
if job[1] ~= 'in_flight' or job[5] ~= ARGV[7] or (tonumber(job[6]) or 0) <= tonumber(ARGV[2]) then
    return 'not_in_flight'
end
local action = ARGV[1]
local attempt = tonumber(job[2])
if action ~= 'discard' then
    attempt = attempt + 1
end
redis.call('ZREM', KEYS[3], job[4])
redis.call('HSET', KEYS[1], 'attempt', tostring(attempt), 'lease_worker', '', 'lease_expires', '', 'updated_at', ARGV[2])
if ARGV[5] ~= '' then
    redis.call('HSET', KEYS[1], 'body', ARGV[5])
end
local status = 'failed_permanent'
if action == 'ack' then
    status = 'delivered'
elseif action == 'retry' then
    if attempt < tonumber(job[3]) then
        redis.call('HSET', KEYS[1], 'status', 'pending', 'not_before', ARGV[3], 'due_at', ARGV[3])
        redis.call('ZADD', KEYS[2], ARGV[3], job[4])
        return 'pending'
    end
    redis.call('HSET', KEYS[1], 'failure_reason', 'max attempts (' .. job[3] .. ') exhausted')
else
    redis.call('HSET', KEYS[1], 'failure_reason', ARGV[4])
end
redis.call('HSET', KEYS[1], 'status', status)
redis.call('PEXPIRE', KEYS[1], ARGV[6])
if status == 'delivered' then
    redis.call('INCR', KEYS[4])
else
    redis.call('INCR', KEYS[5])
end
return status
";

const EXTEND_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 'missing'
end
local job = redis.call('HMGET', KEYS[1], 'status', 'member', 'lease_worker', 'lease_expires')
if job[1] ~= 'in_flight' or job[3] ~= ARGV[1] or (tonumber(job[4]) or 0) <= tonumber(ARGV[2]) then
    return 'not_in_flight'
end
redis.call('ZADD', KEYS[2], ARGV[3], job[2])
redis.call('HSET', KEYS[1], 'lease_expires', ARGV[3], 'updated_at', ARGV[2])
return 'ok'
";

/// Multi-process queue backend on Redis.
pub struct RedisJobQueue<T> {
    redis: Arc<ConnectionManager>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    prefix: String,
    enqueue_script: Script,
    claim_script: Script,
    transition_script: Script,
    extend_script: Script,
    _body: PhantomData<fn() -> T>,
}

impl<T: QueueJob> RedisJobQueue<T> {
    /// Create a queue on the system clock
    pub fn new(redis: ConnectionManager, config: QueueConfig) -> Self {
        Self::with_clock(redis, config, Arc::new(SystemClock))
    }

    /// Create a queue on an explicit clock
    pub fn with_clock(redis: ConnectionManager, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let prefix = format!("jobq:{{{}}}", config.name);
        info!(queue = %config.name, prefix = %prefix, "Created Redis job queue");
        Self {
            redis: Arc::new(redis),
            config,
            clock,
            prefix,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            transition_script: Script::new(TRANSITION_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
            _body: PhantomData,
        }
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    fn inflight_key(&self) -> String {
        format!("{}:inflight", self.prefix)
    }

    fn counter_key(&self, status: JobStatus) -> String {
        format!("{}:{}", self.prefix, status)
    }

    async fn transition(
        &self,
        id: JobId,
        worker_id: &str,
        action: &str,
        backoff: Duration,
        reason: &str,
        body: Option<&T>,
    ) -> QueueResult<JobStatus> {
        let now = self.clock.now();
        let due_ms = add_duration(now, backoff).timestamp_millis();
        let body = match body {
            Some(body) => serde_json::to_string(body)?,
            None => String::new(),
        };
        let retention_ms = u64::try_from(self.config.retention.as_millis()).unwrap_or(u64::MAX);

        let mut conn = (*self.redis).clone();
        let result: String = self
            .transition_script
            .key(self.job_key(&id.to_string()))
            .key(self.pending_key())
            .key(self.inflight_key())
            .key(self.counter_key(JobStatus::Delivered))
            .key(self.counter_key(JobStatus::FailedPermanent))
            .arg(action)
            .arg(now.timestamp_millis())
            .arg(due_ms)
            .arg(reason)
            .arg(body)
            .arg(retention_ms.max(1))
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await?;

        let status = match result.as_str() {
            "missing" => return Err(QueueError::NotFound(id)),
            "not_in_flight" => return Err(QueueError::NotInFlight(id)),
            other => JobStatus::from_str(other).map_err(|e| QueueError::Corrupt {
                id: id.to_string(),
                details: format!("unexpected transition result '{}': {}", other, e),
            })?,
        };

        self.publish_depth().await;
        metrics::record_resolved(&self.config.name, status.as_ref());
        debug!(queue = %self.config.name, job_id = %id, action = action, status = %status, "Job resolved");
        Ok(status)
    }

    async fn publish_depth(&self) {
        match self.stats().await {
            Ok(stats) => metrics::set_queue_depth(&self.config.name, stats.pending, stats.in_flight),
            Err(e) => debug!(queue = %self.config.name, error = %e, "Failed to read queue depth"),
        }
    }
}

#[async_trait]
impl<T: QueueJob> JobQueue<T> for RedisJobQueue<T> {
    async fn enqueue(&self, request: EnqueueRequest<T>) -> QueueResult<JobId> {
        if let Err(reason) = request.validate() {
            metrics::record_rejected(&self.config.name, "invalid");
            warn!(queue = %self.config.name, reason = %reason, "Rejected invalid job");
            return Err(QueueError::InvalidJob(reason));
        }

        let now = self.clock.now();
        let id = Uuid::new_v4();
        let body = serde_json::to_string(&request.body)?;
        let due_at = request.not_before.unwrap_or(now);
        let not_before = request
            .not_before
            .map(|at| at.timestamp_millis().to_string())
            .unwrap_or_default();
        let dedupe_key = request.dedupe_key.clone().unwrap_or_default();
        let dedupe_window_ms =
            u64::try_from(self.config.dedupe_window.as_millis()).unwrap_or(u64::MAX);

        let mut conn = (*self.redis).clone();
        let result: Vec<String> = self
            .enqueue_script
            .key(self.job_key(&id.to_string()))
            .key(self.pending_key())
            .key(self.inflight_key())
            .key(format!("{}:seq", self.prefix))
            .key(format!("{}:dedupe:{}", self.prefix, dedupe_key))
            .arg(id.to_string())
            .arg(body)
            .arg(request.max_attempts)
            .arg(not_before)
            .arg(due_at.timestamp_millis())
            .arg(now.timestamp_millis())
            .arg(&dedupe_key)
            .arg(dedupe_window_ms.max(1))
            .arg(self.config.max_depth)
            .invoke_async(&mut conn)
            .await?;

        match result.as_slice() {
            [outcome, existing] if outcome == "dup" => {
                metrics::record_deduplicated(&self.config.name);
                debug!(queue = %self.config.name, job_id = %existing, dedupe_key = %dedupe_key, "Duplicate enqueue collapsed");
                parse_id(existing)
            }
            [outcome, _] if outcome == "full" => {
                metrics::record_rejected(&self.config.name, "full");
                warn!(queue = %self.config.name, max_depth = self.config.max_depth, "Queue full, rejecting job");
                Err(QueueError::QueueFull(self.config.max_depth))
            }
            [outcome, _] if outcome == "ok" => {
                metrics::record_enqueued(&self.config.name);
                self.publish_depth().await;
                debug!(queue = %self.config.name, job_id = %id, not_before = ?request.not_before, "Enqueued job");
                Ok(id)
            }
            other => Err(QueueError::Corrupt {
                id: id.to_string(),
                details: format!("unexpected enqueue result {:?}", other),
            }),
        }
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> QueueResult<Option<Job<T>>> {
        let now = self.clock.now();
        let expires_at = add_duration(now, lease);

        let mut conn = (*self.redis).clone();
        let (expired, claimed): (String, String) = self
            .claim_script
            .key(self.pending_key())
            .key(self.inflight_key())
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis())
            .arg(worker_id)
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await?;

        let expired = expired.parse::<usize>().unwrap_or(0);
        if expired > 0 {
            debug!(queue = %self.config.name, count = expired, "Expired leases returned to pending");
        }
        metrics::record_leases_expired(&self.config.name, expired);

        if claimed.is_empty() {
            return Ok(None);
        }

        let id = parse_id(&claimed)?;
        let job = self.get(id).await?.ok_or(QueueError::NotFound(id))?;
        metrics::record_claimed(&self.config.name);
        self.publish_depth().await;
        debug!(
            queue = %self.config.name,
            job_id = %id,
            worker_id = %worker_id,
            attempt = job.attempt,
            "Claimed job"
        );
        Ok(Some(job))
    }

    async fn extend_lease(&self, id: JobId, worker_id: &str, lease: Duration) -> QueueResult<DateTime<Utc>> {
        let now = self.clock.now();
        let expires_at = add_duration(now, lease);

        let mut conn = (*self.redis).clone();
        let result: String = self
            .extend_script
            .key(self.job_key(&id.to_string()))
            .key(self.inflight_key())
            .arg(worker_id)
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match result.as_str() {
            "ok" => {
                debug!(queue = %self.config.name, job_id = %id, worker_id = %worker_id, expires_at = %expires_at, "Lease extended");
                Ok(expires_at)
            }
            "missing" => Err(QueueError::NotFound(id)),
            _ => Err(QueueError::NotInFlight(id)),
        }
    }

    async fn ack(&self, id: JobId, worker_id: &str) -> QueueResult<()> {
        self.transition(id, worker_id, "ack", Duration::ZERO, "", None).await?;
        Ok(())
    }

    async fn retry(&self, id: JobId, worker_id: &str, backoff: Duration) -> QueueResult<JobStatus> {
        self.transition(id, worker_id, "retry", backoff, "", None).await
    }

    async fn retry_with(
        &self,
        id: JobId,
        worker_id: &str,
        backoff: Duration,
        body: T,
    ) -> QueueResult<JobStatus> {
        self.transition(id, worker_id, "retry", backoff, "", Some(&body)).await
    }

    async fn fail(&self, id: JobId, worker_id: &str, reason: &str) -> QueueResult<()> {
        self.transition(id, worker_id, "fail", Duration::ZERO, reason, None).await?;
        Ok(())
    }

    async fn discard(&self, id: JobId, worker_id: &str, reason: &str) -> QueueResult<()> {
        self.transition(id, worker_id, "discard", Duration::ZERO, reason, None).await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job<T>>> {
        let mut conn = (*self.redis).clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.job_key(&id.to_string()))
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(id, &fields).map(Some)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = (*self.redis).clone();
        let (pending, in_flight, delivered, failed): (usize, usize, Option<usize>, Option<usize>) =
            redis::pipe()
                .cmd("ZCARD")
                .arg(self.pending_key())
                .cmd("ZCARD")
                .arg(self.inflight_key())
                .cmd("GET")
                .arg(self.counter_key(JobStatus::Delivered))
                .cmd("GET")
                .arg(self.counter_key(JobStatus::FailedPermanent))
                .query_async(&mut conn)
                .await?;

        Ok(QueueStats {
            pending,
            in_flight,
            delivered: delivered.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

fn parse_id(raw: &str) -> QueueResult<JobId> {
    Uuid::parse_str(raw).map_err(|e| QueueError::Corrupt {
        id: raw.to_string(),
        details: e.to_string(),
    })
}

/// Typed access to a stored job hash.
struct Fields<'a> {
    id: JobId,
    map: &'a HashMap<String, String>,
}

impl<'a> Fields<'a> {
    fn corrupt(&self, details: String) -> QueueError {
        QueueError::Corrupt {
            id: self.id.to_string(),
            details,
        }
    }

    fn text(&self, name: &str) -> QueueResult<&'a str> {
        self.map
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| self.corrupt(format!("missing field '{}'", name)))
    }

    fn optional_text(&self, name: &str) -> Option<String> {
        self.map.get(name).filter(|v| !v.is_empty()).cloned()
    }

    fn number(&self, name: &str) -> QueueResult<u32> {
        self.text(name)?
            .parse::<u32>()
            .map_err(|e| self.corrupt(format!("bad number in '{}': {}", name, e)))
    }

    fn timestamp(&self, name: &str) -> QueueResult<Option<DateTime<Utc>>> {
        let raw = self.text(name)?;
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .map(Some)
            .ok_or_else(|| self.corrupt(format!("bad timestamp in '{}': {}", name, raw)))
    }

    fn required_timestamp(&self, name: &str) -> QueueResult<DateTime<Utc>> {
        self.timestamp(name)?
            .ok_or_else(|| self.corrupt(format!("empty field '{}'", name)))
    }
}

/// Rebuild a job from its stored hash fields.
fn job_from_fields<T: QueueJob>(id: JobId, map: &HashMap<String, String>) -> QueueResult<Job<T>> {
    let fields = Fields { id, map };

    let status = JobStatus::from_str(fields.text("status")?)
        .map_err(|e| fields.corrupt(format!("bad status: {}", e)))?;
    let body: T = serde_json::from_str(fields.text("body")?)?;

    let lease = match (
        fields.optional_text("lease_worker"),
        fields.timestamp("lease_expires")?,
    ) {
        (Some(worker_id), Some(expires_at)) => Some(Lease {
            worker_id,
            expires_at,
        }),
        _ => None,
    };

    Ok(Job {
        id,
        body,
        attempt: fields.number("attempt")?,
        max_attempts: fields.number("max_attempts")?,
        not_before: fields.timestamp("not_before")?,
        status,
        enqueued_at: fields.required_timestamp("enqueued_at")?,
        updated_at: fields.required_timestamp("updated_at")?,
        lease,
        dedupe_key: fields.optional_text("dedupe_key"),
        failure_reason: fields.optional_text("failure_reason"),
    })
}
