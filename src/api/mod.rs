//! HTTP surface: push webhook plus operational REST endpoints.

pub mod forwarding;
pub mod mailbox;
pub mod records;
pub mod webhook;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::error::{
    BackfillError, DatabaseError, ForwardingError, ProviderError, ReconcileError, TenantError,
    WatchError,
};
use crate::pipeline::Backfill;
use crate::reconcile::Reconciler;
use crate::routing::EntityRouter;
use crate::store::SystemStore;
use crate::watch::{IngestQueue, PushIngestor, WatchManager};

pub use webhook::{RateLimiter, WebhookGuard};

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SystemStore>,
    pub router: Arc<EntityRouter>,
    pub watches: Arc<WatchManager>,
    pub ingestor: Arc<PushIngestor>,
    pub queue: Arc<IngestQueue>,
    pub backfill: Arc<Backfill>,
    pub reconciler: Arc<Reconciler>,
    pub webhook: Arc<WebhookGuard>,
}

/// Build the full router.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/mailbox/webhook", post(webhook::receive))
        .route("/api/mailbox/link", post(mailbox::link))
        .route("/api/mailbox/watches", get(mailbox::list_watches))
        .route(
            "/api/mailbox/watches/{mailbox}",
            get(mailbox::get_watch).delete(mailbox::unlink),
        )
        .route("/api/mailbox/sync/{mailbox}", post(mailbox::sync))
        .route("/api/mailbox/backfill/{entity_id}", post(mailbox::backfill))
        .route("/api/reconcile/{entity_id}", post(records::reconcile))
        .route("/api/forwarding/test-match", post(forwarding::test_match))
        .route(
            "/api/forwarding/{entity_id}",
            get(forwarding::get_config).post(forwarding::replace_config),
        )
        .route("/api/emails/stats", get(records::email_stats))
        .route("/api/ingest/stats", get(records::ingest_stats))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "bankmail"
    }))
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Error returned by REST handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// The mailbox provider failed or rejected the call.
    Upstream(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Upstream(m) => (StatusCode::BAD_GATEWAY, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => {
                error!(error = %m, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        ApiError::Upstream(e.to_string())
    }
}

impl From<ForwardingError> for ApiError {
    fn from(e: ForwardingError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<WatchError> for ApiError {
    fn from(e: WatchError) -> Self {
        match e {
            WatchError::NotFound(_) => ApiError::NotFound(e.to_string()),
            WatchError::Provider(p) => p.into(),
            WatchError::Database(d) => d.into(),
            WatchError::Cancelled(_) => ApiError::Unavailable(e.to_string()),
            WatchError::Pipeline(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<BackfillError> for ApiError {
    fn from(e: BackfillError) -> Self {
        match e {
            BackfillError::NoForwarding(_) => ApiError::NotFound(e.to_string()),
            BackfillError::UnknownSender { .. } | BackfillError::NoAccount(_) => {
                ApiError::BadRequest(e.to_string())
            }
            BackfillError::NoWatch => ApiError::Conflict(e.to_string()),
            BackfillError::Provider(p) => p.into(),
            BackfillError::Database(d) => d.into(),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::UnknownEntity(_)
            | ReconcileError::Tenant(TenantError::NotFound { .. }) => {
                ApiError::NotFound(e.to_string())
            }
            ReconcileError::Tenant(TenantError::Connectivity { .. }) => {
                ApiError::Unavailable(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
