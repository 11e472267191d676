//! Notifications Domain
//!
//! Notification dispatch for the ERP: producers enqueue jobs, a worker pool
//! delivers them over pluggable channels, and every send is tracked.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │ HR / CRM / Workflow │  ← Producers
//! └──────────┬──────────┘
//!            │ enqueue / schedule
//! ┌──────────▼──────────┐
//! │ NotificationService │  ← Validation, channel policy, dedupe key
//! └──────────┬──────────┘
//!            │
//! ┌──────────▼──────────┐
//! │      JobQueue       │  ← Memory or Redis, leased claims
//! └──────────┬──────────┘
//!            │ claim
//! ┌──────────▼──────────┐      ┌──────────────────┐
//! │     Dispatcher      │─────►│ DeliveryTracker  │  ← One record per send
//! └──────────┬──────────┘      └──────────────────┘
//!            │ send
//! ┌──────────▼──────────┐
//! │   ChannelSender     │  ← In-app inbox, team broadcast, email, SMS, push
//! └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_notifications::{MessageContent, NotificationService};
//!
//! let enqueued = service
//!     .notify_user(user_id, MessageContent::new("Leave approved", "Enjoy your time off"))
//!     .await?;
//!
//! let status = service.latest_status(enqueued.id).await?;
//! ```

pub mod channels;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod service;
pub mod tracker;

pub use channels::{
    ChannelRegistry, ChannelSender, EmailProvider, EmailSender, GatewayError, InAppInbox,
    InAppSender, InboxMessage, LoggingGateway, Outcome, OutcomeKind, PushGateway, PushSender,
    SmsGateway, SmsSender, TeamBroadcastSender,
};
pub use config::{ChannelPolicies, ChannelPolicy, DispatchConfig};
pub use directory::{InMemoryTeamDirectory, TeamDirectory};
pub use dispatcher::{DeliveryEvent, Dispatcher, Resolution};
pub use error::{NotificationError, NotificationResult};
pub use models::{
    Channel, EmailContent, EnqueueNotification, Enqueued, FanoutProgress, MessageContent,
    NotificationJob, NotificationPayload, Priority, PushContent, Recipient, ScheduledContent,
    SmsContent,
};
pub use service::NotificationService;
#[cfg(feature = "redis")]
pub use tracker::RedisAttemptStore;
pub use tracker::{
    AttemptStore, DeliveryAttempt, DeliveryTracker, History, MemoryAttemptStore, StatusSnapshot,
};
