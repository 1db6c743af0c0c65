//! Queue administration routes

use crate::error::ApiError;
use crate::state::{caller_from_headers, AppState};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use conveyor_core::{Error, JobStatus, QueueConfiguration};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

async fn list_queues(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    let summaries = state.control.queue_list(&caller).await?;
    Ok(Json(json!({ "queues": summaries })))
}

async fn queue_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    let detail = state.control.queue_detail(&caller, &name).await?;
    Ok(Json(serde_json::to_value(detail).map_err(Error::from)?))
}

async fn pause_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    let descriptor = state.control.pause_queue(&caller, &name).await?;
    Ok(Json(serde_json::to_value(descriptor).map_err(Error::from)?))
}

async fn resume_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    let descriptor = state.control.resume_queue(&caller, &name).await?;
    Ok(Json(serde_json::to_value(descriptor).map_err(Error::from)?))
}

/// Request body for cleaning a queue
#[derive(Debug, Deserialize)]
pub struct CleanRequest {
    /// Only records older than this are purged
    pub older_than_secs: u64,

    /// Restrict to these statuses; all when omitted
    pub statuses: Option<Vec<String>>,
}

async fn clean_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(request): Json<CleanRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);

    let statuses = match &request.statuses {
        None => None,
        Some(names) => {
            let mut statuses = Vec::with_capacity(names.len());
            for name in names {
                let status = JobStatus::parse(name)
                    .ok_or_else(|| Error::validation(format!("unknown status '{}'", name)))?;
                statuses.push(status);
            }
            Some(statuses)
        }
    };

    let removed = state
        .control
        .clean_queue(
            &caller,
            &name,
            Duration::from_secs(request.older_than_secs),
            statuses.as_deref(),
        )
        .await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn update_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(configuration): Json<QueueConfiguration>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    let descriptor = state
        .control
        .update_queue_config(&caller, &name, configuration)
        .await?;
    Ok(Json(serde_json::to_value(descriptor).map_err(Error::from)?))
}

/// Metrics window parameters
#[derive(Debug, Deserialize)]
pub struct MetricsParams {
    pub queue: Option<String>,

    #[serde(default = "default_window_hours")]
    pub hours: u32,
}

fn default_window_hours() -> u32 {
    24
}

async fn metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<MetricsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    let report = state
        .control
        .metrics(&caller, params.queue.as_deref(), params.hours)
        .await?;
    Ok(Json(serde_json::to_value(report).map_err(Error::from)?))
}

/// Router for queue routes
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/queues", get(list_queues))
        .route("/queues/:name", get(queue_detail))
        .route("/queues/:name/pause", post(pause_queue))
        .route("/queues/:name/resume", post(resume_queue))
        .route("/queues/:name/clean", post(clean_queue))
        .route("/queues/:name/config", put(update_config))
        .route("/metrics", get(metrics))
}
