//! Job Queue
//!
//! A leased job queue for background delivery work.
//!
//! ## Features
//!
//! - **Generic queue**: `JobQueue<T>` holds any job body implementing `QueueJob`
//! - **Delayed delivery**: jobs carry an optional `not_before` and are only claimable once due
//! - **Leases**: a claimed job is reserved for one worker until ack/retry or lease expiry
//! - **At-least-once**: an expired lease silently returns the job to pending
//! - **Idempotent enqueue**: a caller-supplied dedupe key collapses repeats within a window
//! - **Backpressure**: a configured max depth makes `enqueue` fail fast with `QueueFull`
//! - **Backends**: in-memory (`MemoryJobQueue`) and Redis (`RedisJobQueue`, feature `redis`)
//! - **Prometheus metrics**: built-in observability
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──claim──> in_flight ──ack──────────────> delivered
//!    ^                   │ ──retry (attempt<max)──> pending (not_before = now + backoff)
//!    │                   │ ──retry (attempt>=max)─> failed_permanent
//!    │                   │ ──fail / discard───────> failed_permanent
//!    └──lease expiry─────┘
//! ```
//!
//! Only the worker holding a live lease can move a job out of `in_flight`;
//! long work keeps its lease with `extend_lease`.
//!
//! ## Example
//!
//! ```ignore
//! use job_queue::{EnqueueRequest, JobQueue, MemoryJobQueue, QueueConfig};
//!
//! let queue = MemoryJobQueue::<MyJob>::new(QueueConfig::default());
//! let id = queue.enqueue(EnqueueRequest::new(job).with_max_attempts(3)).await?;
//!
//! if let Some(job) = queue.claim("worker-1", Duration::from_secs(30)).await? {
//!     // ... do the work ...
//!     queue.ack(job.id, "worker-1").await?;
//! }
//! ```

mod backoff;
mod clock;
mod config;
mod error;
mod job;
mod memory;
pub mod metrics;
mod queue;
#[cfg(feature = "redis")]
mod redis_queue;

// Re-export main types
pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use error::{QueueError, QueueResult};
pub use job::{EnqueueRequest, Job, JobId, JobStatus, Lease, QueueJob};
pub use memory::MemoryJobQueue;
pub use metrics::init_metrics;
pub use queue::{JobQueue, QueueStats};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
