//! Reconciliation and statistics routes.

use axum::Json;
use axum::extract::{Path, State};

use super::{ApiError, AppState};
use crate::reconcile::ReconcileReport;
use crate::store::MatchingStats;
use crate::watch::QueueStats;

/// POST /api/reconcile/{entity_id}
pub async fn reconcile(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> Result<Json<ReconcileReport>, ApiError> {
    Ok(Json(state.reconciler.reconcile(&entity_id).await?))
}

/// GET /api/emails/stats
pub async fn email_stats(State(state): State<AppState>) -> Result<Json<MatchingStats>, ApiError> {
    Ok(Json(state.store.matching_stats().await?))
}

/// GET /api/ingest/stats
pub async fn ingest_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.queue.stats())
}
