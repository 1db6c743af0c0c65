//! Delayed and recurring submission routes

use crate::error::ApiError;
use crate::state::{caller_from_headers, AppState};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

/// Request body for a one-shot delayed submission
#[derive(Debug, Deserialize)]
pub struct DelayedRequest {
    pub queue: String,

    #[serde(rename = "type")]
    pub job_type: String,

    pub payload: serde_json::Value,

    pub delay_ms: u64,
}

async fn schedule_delayed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DelayedRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let caller = caller_from_headers(&headers);
    let id = state
        .control
        .schedule_delayed(
            &caller,
            &request.queue,
            &request.job_type,
            request.payload,
            request.delay_ms,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// Request body for registering a cron entry
#[derive(Debug, Deserialize)]
pub struct RepeatingRequest {
    pub queue: String,

    #[serde(rename = "type")]
    pub job_type: String,

    pub payload: serde_json::Value,

    pub cron: String,
}

async fn schedule_repeating(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RepeatingRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let caller = caller_from_headers(&headers);
    let name = state
        .control
        .schedule_repeating(
            &caller,
            &request.queue,
            &request.job_type,
            request.payload,
            &request.cron,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "name": name }))))
}

async fn list_repeating(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    let entries = state.control.list_scheduled(&caller).await?;
    Ok(Json(json!({ "entries": entries })))
}

async fn cancel_repeating(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    state.control.cancel_scheduled(&caller, &name).await?;
    Ok(Json(json!({ "cancelled": true })))
}

async fn trigger_repeating(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let caller = caller_from_headers(&headers);
    let id = state.control.trigger_scheduled(&caller, &name).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// Router for scheduler routes
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/scheduler/delayed", post(schedule_delayed))
        .route(
            "/scheduler/repeating",
            get(list_repeating).post(schedule_repeating),
        )
        .route("/scheduler/repeating/:name", delete(cancel_repeating))
        .route("/scheduler/repeating/:name/trigger", post(trigger_repeating))
}
