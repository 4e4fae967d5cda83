//! Forwarding rule routes.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use tracing::info;

use super::{ApiError, AppState};
use crate::routing::{MatchResult, RuleInput, normalize_rules};
use crate::store::ForwardingConfig;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceForwarding {
    #[serde(default = "default_active")]
    pub active: bool,
    pub rules: Vec<RuleInput>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMatch {
    pub from: String,
    #[serde(default)]
    pub subject: String,
}

/// GET /api/forwarding/{entity_id}
pub async fn get_config(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> Result<Json<ForwardingConfig>, ApiError> {
    state
        .store
        .get_forwarding(&entity_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No forwarding config for {entity_id}")))
}

/// POST /api/forwarding/{entity_id}
///
/// Replaces the entity's whole rule list.
pub async fn replace_config(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Json(body): Json<ReplaceForwarding>,
) -> Result<Json<ForwardingConfig>, ApiError> {
    let rules = normalize_rules(&entity_id, &body.rules)?;
    state
        .store
        .replace_forwarding(&entity_id, body.active, &rules)
        .await?;
    info!(entity_id = %entity_id, rules = rules.len(), active = body.active, "Forwarding rules replaced");

    state
        .store
        .get_forwarding(&entity_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::Internal(format!("forwarding config for {entity_id} vanished")))
}

/// POST /api/forwarding/test-match
pub async fn test_match(
    State(state): State<AppState>,
    Json(body): Json<TestMatch>,
) -> Json<MatchResult> {
    Json(state.router.match_sender(&body.from, &body.subject).await)
}
