//! Prometheus metrics for job queues and their workers
//!
//! Provides observability into queue depth, lease recovery and delivery outcomes.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. If another
/// recorder is already installed, metrics stay disabled and a warning is logged.
pub fn init_metrics() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_ok() {
                info!("Prometheus metrics initialized");
            }
        }
        Err(e) => warn!(error = %e, "Failed to install Prometheus recorder"),
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn get_metrics_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    get_metrics_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Record a job accepted by `enqueue`
pub fn record_enqueued(queue: &str) {
    counter!("notify_jobs_enqueued_total", "queue" => queue.to_string()).increment(1);
}

/// Record an enqueue collapsed onto an existing job by its dedupe key
pub fn record_deduplicated(queue: &str) {
    counter!("notify_jobs_deduplicated_total", "queue" => queue.to_string()).increment(1);
}

/// Record an enqueue rejected (invalid or queue full)
pub fn record_rejected(queue: &str, reason: &'static str) {
    counter!(
        "notify_jobs_rejected_total",
        "queue" => queue.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a successful claim
pub fn record_claimed(queue: &str) {
    counter!("notify_jobs_claimed_total", "queue" => queue.to_string()).increment(1);
}

/// Record leases that ran out and were returned to pending
pub fn record_leases_expired(queue: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!("notify_leases_expired_total", "queue" => queue.to_string())
        .increment(count as u64);
}

/// Record a job transition out of in-flight
pub fn record_resolved(queue: &str, status: &str) {
    counter!(
        "notify_jobs_resolved_total",
        "queue" => queue.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Update the queue depth gauges
pub fn set_queue_depth(queue: &str, pending: usize, in_flight: usize) {
    gauge!("notify_queue_depth", "queue" => queue.to_string(), "state" => "pending")
        .set(pending as f64);
    gauge!("notify_queue_depth", "queue" => queue.to_string(), "state" => "in_flight")
        .set(in_flight as f64);
}

/// Record one channel sender invocation
pub fn record_delivery_attempt(channel: &str, outcome: &str, duration: Duration) {
    counter!(
        "notify_delivery_attempts_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        "notify_send_duration_seconds",
        "channel" => channel.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a job whose channel has no registered sender
pub fn record_unsupported_channel(channel: &str) {
    counter!(
        "notify_unsupported_channel_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Update the busy-worker gauge
pub fn set_busy_workers(queue: &str, busy: usize) {
    gauge!("notify_busy_workers", "queue" => queue.to_string()).set(busy as f64);
}
