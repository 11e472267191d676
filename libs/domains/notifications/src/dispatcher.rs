//! Dispatcher worker pool.
//!
//! Each worker loops claim → execute → resolve:
//!
//! 1. Claim the earliest due job under a lease.
//! 2. Resolve the channel's sender. An unregistered channel discards the job.
//! 3. Expand team recipients into members and skip anyone already sent in
//!    this round (a replay after a lost lease).
//! 4. Send to every recipient concurrently, each under a timeout and panic
//!    isolation, and record each attempt as its send completes. The lease is
//!    renewed while sends run; losing it abandons the round.
//! 5. Retry the retryable recipients, fail if nobody was ever reached,
//!    otherwise ack.

use crate::channels::{ChannelRegistry, ChannelSender, Outcome, OutcomeKind};
use crate::config::DispatchConfig;
use crate::directory::TeamDirectory;
use crate::error::NotificationResult;
use crate::models::{Channel, FanoutProgress, NotificationJob, NotificationPayload, Recipient};
use crate::tracker::{DeliveryAttempt, DeliveryTracker};
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt, stream};
use job_queue::metrics;
use job_queue::{Clock, Job, JobId, JobQueue, JobStatus, QueueError, SystemClock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// How a claimed job left the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    Delivered,
    /// Rescheduled for the recipients that failed transiently. `status` is
    /// `failed_permanent` when this round used the last attempt.
    Retried { status: JobStatus, backoff_ms: u64 },
    Failed { reason: String },
    /// Terminal without a send: unsupported channel or nobody to deliver to.
    Discarded { reason: String },
    /// The lease ran out before resolution; another worker owns the job now.
    LeaseLost,
}

/// Published after every resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub job_id: JobId,
    pub channel: Channel,
    pub attempt_number: u32,
    pub worker_id: String,
    /// Sends in this round, by outcome.
    pub sent: usize,
    pub retryable: usize,
    pub permanent: usize,
    /// Recipients already sent in an earlier run of this round.
    pub skipped: usize,
    pub resolution: Resolution,
    pub at: DateTime<Utc>,
}

/// Outcome of one send, before it is recorded.
struct SendResult {
    recipient: Recipient,
    outcome: Outcome,
    elapsed: Duration,
    at: DateTime<Utc>,
}

/// Worker pool driving jobs from the queue to channel senders.
pub struct Dispatcher {
    queue: Arc<dyn JobQueue<NotificationJob>>,
    tracker: Arc<DeliveryTracker>,
    registry: ChannelRegistry,
    directory: Arc<dyn TeamDirectory>,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<DeliveryEvent>,
    busy: AtomicUsize,
    /// Prefix for worker ids, unique per dispatcher so leases from separate
    /// processes sharing a queue never collide.
    instance: String,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue<NotificationJob>>,
        tracker: Arc<DeliveryTracker>,
        registry: ChannelRegistry,
        directory: Arc<dyn TeamDirectory>,
        config: DispatchConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue,
            tracker,
            registry,
            directory,
            config,
            clock: Arc::new(SystemClock),
            events,
            busy: AtomicUsize::new(0),
            instance: Uuid::new_v4().simple().to_string()[..8].to_string(),
        }
    }

    /// Timestamp attempts with `clock`. Use the queue's clock in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Receive a `DeliveryEvent` per resolved job.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Workers currently processing a job.
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    /// Run `config.workers` workers until `shutdown` flips to true.
    ///
    /// A job in progress when shutdown is signalled is finished first.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            queue = %self.queue.name(),
            channels = ?self.registry.channels(),
            "Starting notification dispatcher"
        );

        let mut workers = JoinSet::new();
        for index in 0..self.config.workers {
            let dispatcher = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                dispatcher
                    .worker_loop(format!("{}-worker-{}", dispatcher.instance, index), shutdown)
                    .await
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Dispatcher worker task failed");
            }
        }

        info!("Notification dispatcher stopped");
    }

    async fn worker_loop(&self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id = %worker_id, "Worker started");
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_once(&worker_id).await {
                Ok(Some(_)) => {
                    consecutive_errors = 0;
                    continue;
                }
                Ok(None) => {
                    if consecutive_errors > 0 {
                        info!(worker_id = %worker_id, "Queue recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }
                    self.report_depth().await;
                    self.config.idle_poll
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = self
                        .config
                        .idle_poll
                        .saturating_mul(1u32 << consecutive_errors.min(5))
                        .min(MAX_ERROR_BACKOFF);
                    warn!(
                        worker_id = %worker_id,
                        error = %e,
                        consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        "Dispatch failed, backing off"
                    );
                    backoff
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        debug!(worker_id = %worker_id, "Worker stopped");
    }

    async fn report_depth(&self) {
        match self.queue.stats().await {
            Ok(stats) => metrics::set_queue_depth(self.queue.name(), stats.pending, stats.in_flight),
            Err(e) => debug!(error = %e, "Failed to read queue stats"),
        }
    }

    /// Claim and fully process at most one job.
    ///
    /// Returns `Ok(None)` when nothing is due. An `Err` means a queue, tracker
    /// or directory backend failed; the claimed job (if any) stays in flight
    /// and is replayed once its lease expires.
    pub async fn run_once(&self, worker_id: &str) -> NotificationResult<Option<DeliveryEvent>> {
        let Some(job) = self.queue.claim(worker_id, self.config.lease).await? else {
            return Ok(None);
        };

        let busy = self.busy.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_busy_workers(self.queue.name(), busy);

        let result = self.process(worker_id, job).await;

        let busy = self.busy.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::set_busy_workers(self.queue.name(), busy);

        let event = result?;
        let _ = self.events.send(event.clone());
        Ok(Some(event))
    }

    async fn process(&self, worker_id: &str, job: Job<NotificationJob>) -> NotificationResult<DeliveryEvent> {
        let channel = job.body.channel();
        let attempt_number = job.attempt + 1;
        debug!(
            job_id = %job.id,
            channel = %channel,
            worker_id = %worker_id,
            attempt = attempt_number,
            max_attempts = job.max_attempts,
            "Processing notification"
        );

        let event = |resolution: Resolution, counts: [usize; 4]| DeliveryEvent {
            job_id: job.id,
            channel,
            attempt_number,
            worker_id: worker_id.to_string(),
            sent: counts[0],
            retryable: counts[1],
            permanent: counts[2],
            skipped: counts[3],
            resolution,
            at: self.clock.now(),
        };

        let Some(sender) = self.registry.get(channel) else {
            let reason = format!("UnsupportedChannel: {}", channel);
            error!(
                job_id = %job.id,
                channel = %channel,
                "No sender registered for channel, discarding job"
            );
            metrics::record_unsupported_channel(channel.as_ref());
            let resolution = self.discard(job.id, worker_id, &reason).await?;
            return Ok(event(resolution, [0; 4]));
        };

        let recipients = self.expand_recipients(&job.body.recipients).await?;
        if recipients.is_empty() {
            let reason = "no recipients after team expansion".to_string();
            warn!(job_id = %job.id, channel = %channel, "Nobody to notify, discarding job");
            let resolution = self.discard(job.id, worker_id, &reason).await?;
            return Ok(event(resolution, [0; 4]));
        }

        let already_sent = self.tracker.sent_recipients(job.id, attempt_number).await?;
        let (skipped, pending): (Vec<Recipient>, Vec<Recipient>) = recipients
            .into_iter()
            .partition(|recipient| already_sent.contains(recipient));
        if !skipped.is_empty() {
            info!(
                job_id = %job.id,
                attempt = attempt_number,
                skipped = skipped.len(),
                "Replaying round, skipping recipients already sent"
            );
        }

        let sends = self.send_and_record(sender.as_ref(), &job, attempt_number, pending);
        let Some(results) = self.holding_lease(worker_id, job.id, sends).await else {
            return Ok(event(Resolution::LeaseLost, [0, 0, 0, skipped.len()]));
        };
        let results = results?;

        let sent = results.iter().filter(|r| r.outcome.is_sent()).count();
        let retry_recipients: Vec<Recipient> = results
            .iter()
            .filter(|r| r.outcome.kind() == OutcomeKind::RetryableError)
            .map(|r| r.recipient.clone())
            .collect();
        let permanent: Vec<&SendResult> = results
            .iter()
            .filter(|r| r.outcome.kind() == OutcomeKind::PermanentError)
            .collect();
        let counts = [sent, retry_recipients.len(), permanent.len(), skipped.len()];

        let previous = job.body.progress;
        let progress = FanoutProgress {
            round: attempt_number,
            delivered: previous.delivered + count_u32(sent + skipped.len()),
            failed: previous.failed + count_u32(permanent.len()),
        };

        let resolution = if !retry_recipients.is_empty() {
            let policy = self.config.policies.get(channel);
            let backoff = policy.backoff.delay(job.attempt);
            let body = job.body.narrowed(retry_recipients, progress);
            match self.queue.retry_with(job.id, worker_id, backoff, body).await {
                Ok(status) => {
                    if status == JobStatus::FailedPermanent {
                        warn!(
                            job_id = %job.id,
                            channel = %channel,
                            attempts = attempt_number,
                            "Retries exhausted, notification failed permanently"
                        );
                    } else {
                        debug!(
                            job_id = %job.id,
                            backoff_ms = backoff.as_millis() as u64,
                            "Notification rescheduled"
                        );
                    }
                    Resolution::Retried {
                        status,
                        backoff_ms: u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    }
                }
                Err(e) => self.lease_lost(job.id, e)?,
            }
        } else if progress.delivered == 0 {
            let reason = permanent
                .first()
                .and_then(|r| r.outcome.detail())
                .map(|detail| format!("PermanentError: {}", detail))
                .unwrap_or_else(|| "no recipient delivered".to_string());
            warn!(job_id = %job.id, channel = %channel, reason = %reason, "Notification failed");
            match self.queue.fail(job.id, worker_id, &reason).await {
                Ok(()) => Resolution::Failed { reason },
                Err(e) => self.lease_lost(job.id, e)?,
            }
        } else {
            match self.queue.ack(job.id, worker_id).await {
                Ok(()) => {
                    info!(
                        job_id = %job.id,
                        channel = %channel,
                        delivered = progress.delivered,
                        failed = progress.failed,
                        "Notification delivered"
                    );
                    Resolution::Delivered
                }
                Err(e) => self.lease_lost(job.id, e)?,
            }
        };

        Ok(event(resolution, counts))
    }

    async fn discard(&self, id: JobId, worker_id: &str, reason: &str) -> NotificationResult<Resolution> {
        match self.queue.discard(id, worker_id, reason).await {
            Ok(()) => Ok(Resolution::Discarded {
                reason: reason.to_string(),
            }),
            Err(e) => self.lease_lost(id, e),
        }
    }

    /// A transition refused because we no longer hold the job is not a worker
    /// error; anything else propagates.
    fn lease_lost(&self, id: JobId, err: QueueError) -> NotificationResult<Resolution> {
        match err {
            QueueError::NotInFlight(_) | QueueError::NotFound(_) => {
                warn!(job_id = %id, "Lease lost before resolution, result dropped");
                Ok(Resolution::LeaseLost)
            }
            other => Err(other.into()),
        }
    }

    /// Replace team recipients with their members. Order is preserved and
    /// duplicates dropped.
    async fn expand_recipients(&self, recipients: &[Recipient]) -> NotificationResult<Vec<Recipient>> {
        let mut seen = HashSet::new();
        let mut expanded = Vec::with_capacity(recipients.len());

        for recipient in recipients {
            match recipient {
                Recipient::Team(team_id) => {
                    let members = self.directory.members(*team_id).await?;
                    if members.is_empty() {
                        debug!(team_id = %team_id, "Team has no members");
                    }
                    for member in members {
                        let member = Recipient::User(member);
                        if seen.insert(member.clone()) {
                            expanded.push(member);
                        }
                    }
                }
                other => {
                    if seen.insert(other.clone()) {
                        expanded.push(other.clone());
                    }
                }
            }
        }

        Ok(expanded)
    }

    /// Drive `work` while renewing the job's lease every `lease_renewal`.
    ///
    /// Returns `None` once the queue reports the lease gone; `work` is dropped
    /// at that point, cancelling any send still in flight. A renewal that fails
    /// for another reason is retried on the next tick.
    async fn holding_lease<F: Future>(&self, worker_id: &str, id: JobId, work: F) -> Option<F::Output> {
        let every = self.config.lease_renewal();
        let mut renew = tokio::time::interval_at(Instant::now() + every, every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                biased;
                output = &mut work => return Some(output),
                _ = renew.tick() => {
                    match self.queue.extend_lease(id, worker_id, self.config.lease).await {
                        Ok(expires_at) => {
                            debug!(job_id = %id, worker_id = %worker_id, expires_at = %expires_at, "Lease renewed");
                        }
                        Err(QueueError::NotInFlight(_) | QueueError::NotFound(_)) => {
                            warn!(job_id = %id, worker_id = %worker_id, "Lease lost mid-round, abandoning sends");
                            return None;
                        }
                        Err(e) => {
                            warn!(job_id = %id, worker_id = %worker_id, error = %e, "Failed to renew lease");
                        }
                    }
                }
            }
        }
    }

    /// Send to every recipient, at most `fanout_concurrency` at a time, and
    /// record each attempt as soon as its send completes. A replay of the
    /// round then skips whoever was already reached.
    async fn send_and_record(
        &self,
        sender: &dyn ChannelSender,
        job: &Job<NotificationJob>,
        attempt_number: u32,
        recipients: Vec<Recipient>,
    ) -> NotificationResult<Vec<SendResult>> {
        let payload = &job.body.payload;
        let channel = job.body.channel();
        let concurrency = self.config.fanout_concurrency.max(1);

        let mut sends = stream::iter(recipients)
            .map(|recipient| async move {
                let started = Instant::now();
                let outcome = self.send_one(sender, &recipient, payload).await;
                let elapsed = started.elapsed();
                if let Some(detail) = outcome.detail() {
                    debug!(
                        job_id = %job.id,
                        sender = sender.name(),
                        recipient = %recipient,
                        outcome = %outcome.kind(),
                        detail = %detail,
                        "Send failed"
                    );
                }
                SendResult {
                    recipient,
                    outcome,
                    elapsed,
                    at: self.clock.now(),
                }
            })
            .buffer_unordered(concurrency);

        let mut results = Vec::new();
        while let Some(result) = sends.next().await {
            metrics::record_delivery_attempt(channel.as_ref(), result.outcome.kind().as_ref(), result.elapsed);
            self.tracker
                .record(DeliveryAttempt::new(
                    job.id,
                    attempt_number,
                    result.recipient.clone(),
                    channel,
                    &result.outcome,
                    result.at,
                    result.elapsed,
                ))
                .await?;
            results.push(result);
        }
        Ok(results)
    }

    /// One sender invocation. Timeout is retryable; a panic is permanent.
    async fn send_one(
        &self,
        sender: &dyn ChannelSender,
        recipient: &Recipient,
        payload: &NotificationPayload,
    ) -> Outcome {
        let send = AssertUnwindSafe(async { sender.send(recipient, payload).await }).catch_unwind();
        match tokio::time::timeout(self.config.send_timeout, send).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(sender = sender.name(), recipient = %recipient, panic = %message, "Sender panicked");
                Outcome::PermanentError(format!("sender panicked: {}", message))
            }
            Err(_) => Outcome::RetryableError(format!(
                "send timed out after {}ms",
                self.config.send_timeout.as_millis()
            )),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
