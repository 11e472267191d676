//! Notification Worker Service
//!
//! Runs the notification dispatcher and its admin HTTP server.
//!
//! ## Architecture
//!
//! ```text
//! POST /notifications ──┐
//! in-process producers ─┴─> NotificationService
//!                              ↓
//!                    JobQueue (Redis if REDIS_URL, else memory)
//!                              ↓ claim (leased)
//!                    Dispatcher (NOTIFY_WORKERS workers)
//!                              ↓
//!        in-app inbox | team broadcast | email / sms / push (dry-run gateway)
//!                              ↓
//!                    DeliveryTracker (attempt log)
//! ```
//!
//! ## Features
//!
//! - Leased claims: a crashed worker's job is replayed after the lease
//! - Per-channel retry policy with exponential backoff
//! - Graceful shutdown: in-flight jobs finish before exit
//! - Health, readiness and Prometheus metrics endpoints

pub mod redis_connect;
pub mod routes;

use core_config::redis::RedisConfig;
use core_config::server::AdminServerConfig;
use core_config::{Environment, FromEnv, env_optional};
use domain_notifications::{
    AttemptStore, Channel, ChannelRegistry, DeliveryTracker, DispatchConfig, Dispatcher,
    EmailSender, InAppInbox, InMemoryTeamDirectory, LoggingGateway, MemoryAttemptStore,
    NotificationJob, NotificationService, PushSender, RedisAttemptStore, SmsSender,
};
use eyre::{Result, WrapErr};
use job_queue::{JobQueue, MemoryJobQueue, RedisJobQueue};
use redis::aio::ConnectionManager;
use routes::AdminState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Queue and attempt log, on one backend.
pub struct Backend {
    pub queue: Arc<dyn JobQueue<NotificationJob>>,
    pub attempts: Arc<dyn AttemptStore>,
    pub redis: Option<ConnectionManager>,
}

impl Backend {
    /// Process-local backend. Jobs do not survive a restart.
    pub fn memory(config: &DispatchConfig) -> Self {
        Self {
            queue: Arc::new(MemoryJobQueue::new(config.queue.clone())),
            attempts: Arc::new(MemoryAttemptStore::new().with_retention(config.queue.retention)),
            redis: None,
        }
    }

    pub fn redis(redis: ConnectionManager, config: &DispatchConfig) -> Self {
        Self {
            queue: Arc::new(RedisJobQueue::new(redis.clone(), config.queue.clone())),
            attempts: Arc::new(RedisAttemptStore::new(
                redis.clone(),
                &config.queue.name,
                config.queue.retention,
            )),
            redis: Some(redis),
        }
    }

    /// Redis when configured, memory otherwise.
    pub async fn connect(redis_config: &RedisConfig, config: &DispatchConfig) -> Result<Self> {
        match &redis_config.url {
            Some(url) => {
                info!("Connecting to Redis...");
                let redis = redis_connect::connect_with_retry(url, redis_config.connect_retries)
                    .await
                    .wrap_err("Failed to connect to Redis")?;
                info!(queue = %config.queue.name, "Using Redis queue backend");
                Ok(Self::redis(redis, config))
            }
            None => {
                info!(queue = %config.queue.name, "REDIS_URL not set, using in-memory queue backend");
                Ok(Self::memory(config))
            }
        }
    }
}

/// In-process senders plus dry-run carrier senders.
pub fn default_registry(inbox: InAppInbox) -> ChannelRegistry {
    ChannelRegistry::with_inbox(inbox)
        .register(Channel::Email, Arc::new(EmailSender::new(LoggingGateway)))
        .register(Channel::Sms, Arc::new(SmsSender::new(LoggingGateway)))
        .register(Channel::Push, Arc::new(PushSender::new(LoggingGateway)))
}

async fn start_admin_server(state: AdminState, config: AdminServerConfig) -> Result<()> {
    let app = routes::router(state);
    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind admin server to {}", addr))?;

    info!(address = %addr, "Admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Admin server failed")?;

    Ok(())
}

/// Run the notification worker
///
/// 1. Sets up error reports, structured logging and metrics
/// 2. Loads dispatch, Redis and admin server configuration
/// 3. Picks the queue backend
/// 4. Serves the admin API and runs the dispatcher until SIGINT/SIGTERM
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    job_queue::init_metrics();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        environment = ?environment,
        "Starting notification worker"
    );

    let dispatch_config =
        DispatchConfig::from_env().wrap_err("Failed to load dispatch configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    let admin_config =
        AdminServerConfig::from_env().wrap_err("Failed to load admin server configuration")?;

    info!(
        workers = dispatch_config.workers,
        lease_ms = dispatch_config.lease.as_millis() as u64,
        send_timeout_ms = dispatch_config.send_timeout.as_millis() as u64,
        fanout_concurrency = dispatch_config.fanout_concurrency,
        max_queue_depth = dispatch_config.queue.max_depth,
        "Dispatch configuration loaded"
    );

    let backend = Backend::connect(&redis_config, &dispatch_config).await?;

    let directory = match env_optional("NOTIFY_TEAM_DIRECTORY") {
        Some(path) => InMemoryTeamDirectory::load(&path)
            .await
            .wrap_err_with(|| format!("Failed to load team directory from {}", path))?,
        None => InMemoryTeamDirectory::new(),
    };

    let inbox = InAppInbox::new();
    let tracker = Arc::new(DeliveryTracker::new(
        backend.attempts.clone(),
        backend.queue.clone(),
    ));
    let service = NotificationService::new(
        backend.queue.clone(),
        tracker.clone(),
        dispatch_config.policies.clone(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        backend.queue.clone(),
        tracker,
        default_registry(inbox.clone()),
        Arc::new(directory),
        dispatch_config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let mut state = AdminState::new(service, backend.queue.clone(), inbox);
    if let Some(redis) = backend.redis.clone() {
        state = state.with_redis(redis);
    }
    tokio::spawn(async move {
        if let Err(e) = start_admin_server(state, admin_config).await {
            error!(error = %e, "Admin server failed");
        }
    });

    dispatcher.run(shutdown_rx).await;

    info!("Notification worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
