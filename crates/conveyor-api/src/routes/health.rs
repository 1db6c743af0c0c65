//! Liveness and health routes

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use conveyor_core::Error;

/// Process liveness probe
pub async fn liveness() -> &'static str {
    "OK"
}

/// Per-queue health rollup; open to any caller
pub async fn summary(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state.control.health_summary().await?;
    Ok(Json(serde_json::to_value(summary).map_err(Error::from)?))
}
