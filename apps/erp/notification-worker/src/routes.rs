//! Admin HTTP surface.
//!
//! - Liveness: `GET /health`
//! - Readiness: `GET /ready` (queue backend reachable)
//! - Prometheus metrics: `GET /metrics`
//! - Enqueue: `POST /notifications`
//! - Status and attempt log: `GET /notifications/{id}`, `GET /notifications/{id}/history`
//! - Queue counters: `GET /queue/stats`
//! - In-app inbox: `GET /inbox/{user_id}`

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use domain_notifications::{
    InAppInbox, NotificationError, NotificationJob, NotificationService,
};
use job_queue::JobQueue;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub service: NotificationService,
    pub queue: Arc<dyn JobQueue<NotificationJob>>,
    pub inbox: InAppInbox,
    /// Set when the queue runs on Redis; readiness then pings it.
    pub redis: Option<ConnectionManager>,
    pub app_name: String,
    pub app_version: String,
}

impl AdminState {
    pub fn new(
        service: NotificationService,
        queue: Arc<dyn JobQueue<NotificationJob>>,
        inbox: InAppInbox,
    ) -> Self {
        Self {
            service,
            queue,
            inbox,
            redis: None,
            app_name: env!("CARGO_PKG_NAME").to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_redis(mut self, redis: ConnectionManager) -> Self {
        self.redis = Some(redis);
        self
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/notifications", post(enqueue_handler))
        .route("/notifications/{id}", get(status_handler))
        .route("/notifications/{id}/history", get(history_handler))
        .route("/queue/stats", get(stats_handler))
        .route("/inbox/{user_id}", get(inbox_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Domain error as an HTTP response.
pub struct ApiError(NotificationError);

impl From<NotificationError> for ApiError {
    fn from(err: NotificationError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NotificationError::InvalidJob(_) => StatusCode::BAD_REQUEST,
            NotificationError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            err if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Admin request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

async fn health_handler(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

async fn ready_handler(State(state): State<AdminState>) -> (StatusCode, Json<Value>) {
    let check = match &state.redis {
        Some(redis) => {
            let mut conn = redis.clone();
            let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            pong.map(|_| ()).map_err(|e| e.to_string())
        }
        None => state.queue.stats().await.map(|_| ()).map_err(|e| e.to_string()),
    };
    let backend = if state.redis.is_some() { "redis" } else { "memory" };

    match check {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "checks": { backend: "ok" } })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "checks": { backend: format!("error: {}", e) } })),
        ),
    }
}

async fn metrics_handler() -> Response {
    match job_queue::metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

async fn enqueue_handler(
    State(state): State<AdminState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let enqueued = state.service.enqueue_json(body, None).await?;
    Ok((StatusCode::ACCEPTED, Json(enqueued)))
}

async fn status_handler(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    Ok(match state.service.latest_status(id).await? {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Notification {} not found", id) })),
        )
            .into_response(),
    })
}

async fn history_handler(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state.service.history(id).await?;
    Ok(Json(history.to_vec()))
}

async fn stats_handler(State(state): State<AdminState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.queue.stats().await.map_err(NotificationError::from)?;
    Ok(Json(json!({
        "queue": state.queue.name(),
        "pending": stats.pending,
        "in_flight": stats.in_flight,
        "delivered": stats.delivered,
        "failed": stats.failed,
    })))
}

async fn inbox_handler(
    State(state): State<AdminState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    let messages = state.inbox.messages(user_id).await;
    let unread = messages.iter().filter(|m| !m.read).count();
    Json(json!({ "user_id": user_id, "unread": unread, "messages": messages }))
}
