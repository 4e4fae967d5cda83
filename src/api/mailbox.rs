//! Mailbox routes: link, watches, manual sync and backfill.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use tracing::info;

use super::{ApiError, AppState};
use crate::pipeline::{BackfillReport, BackfillRequest};
use crate::provider::Credentials;
use crate::watch::{SyncReport, WatchView};

/// POST /api/mailbox/link
pub async fn link(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<impl IntoResponse, ApiError> {
    let watch = state.watches.link(credentials).await?;
    info!(mailbox = %watch.mailbox, "Mailbox linked via API");
    Ok((StatusCode::CREATED, Json(WatchView::new(&watch, Utc::now()))))
}

/// GET /api/mailbox/watches
pub async fn list_watches(State(state): State<AppState>) -> Result<Json<Vec<WatchView>>, ApiError> {
    let now = Utc::now();
    let watches = state.watches.list().await?;
    Ok(Json(watches.iter().map(|w| WatchView::new(w, now)).collect()))
}

/// GET /api/mailbox/watches/{mailbox}
pub async fn get_watch(
    State(state): State<AppState>,
    Path(mailbox): Path<String>,
) -> Result<Json<WatchView>, ApiError> {
    let watch = state.watches.status(&mailbox).await?;
    Ok(Json(WatchView::new(&watch, Utc::now())))
}

/// DELETE /api/mailbox/watches/{mailbox}
pub async fn unlink(
    State(state): State<AppState>,
    Path(mailbox): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.watches.unlink(&mailbox).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/mailbox/sync/{mailbox}
pub async fn sync(
    State(state): State<AppState>,
    Path(mailbox): Path<String>,
) -> Result<Json<SyncReport>, ApiError> {
    Ok(Json(state.ingestor.sync_now(&mailbox).await?))
}

/// POST /api/mailbox/backfill/{entity_id}
///
/// The body is optional; an empty body backfills the first configured
/// sender through any active mailbox.
pub async fn backfill(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    body: Option<Json<BackfillRequest>>,
) -> Result<Json<BackfillReport>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.backfill.run(&entity_id, &request).await?))
}
