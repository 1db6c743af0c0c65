//! Job submission and inspection routes

use crate::error::ApiError;
use crate::state::{caller_from_headers, AppState};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use conveyor_core::{Error, JobId, JobOptions, JobQuery, JobStatus};
use serde::Deserialize;
use serde_json::json;

/// Request body for submitting a job
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub queue: String,

    #[serde(rename = "type")]
    pub job_type: String,

    pub payload: serde_json::Value,

    #[serde(flatten)]
    pub options: JobOptions,
}

async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let caller = caller_from_headers(&headers);
    let id = state
        .control
        .submit(
            &caller,
            &request.queue,
            &request.job_type,
            request.payload,
            request.options,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn inspect_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<JobId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    let view = state.control.inspect(&caller, id).await?;
    Ok(Json(serde_json::to_value(view).map_err(Error::from)?))
}

async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<JobId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    state.control.cancel(&caller, id).await?;
    Ok(Json(json!({ "cancelled": true })))
}

async fn retry_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<JobId>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let caller = caller_from_headers(&headers);
    let new_id = state.control.retry(&caller, id).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": new_id }))))
}

/// Request body for bulk cancellation
#[derive(Debug, Deserialize)]
pub struct BulkCancelRequest {
    pub ids: Vec<JobId>,
}

async fn bulk_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BulkCancelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    let outcomes = state.control.bulk_cancel(&caller, &request.ids).await;
    let rows: Vec<serde_json::Value> = outcomes
        .into_iter()
        .map(|(id, outcome)| json!({ "id": id, "outcome": outcome }))
        .collect();
    Ok(Json(json!({ "results": rows })))
}

/// Listing filters accepted on the query string
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub owner: Option<String>,
    pub queue: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListParams {
    fn into_query(self) -> Result<JobQuery, Error> {
        let mut query = JobQuery::new();
        if let Some(job_type) = self.job_type {
            query = query.with_job_type(job_type);
        }
        if let Some(status) = self.status {
            let status = JobStatus::parse(&status)
                .ok_or_else(|| Error::validation(format!("unknown status '{}'", status)))?;
            query = query.with_status(status);
        }
        if let Some(limit) = self.limit {
            query = query.with_limit(limit.min(500));
        }
        if let Some(offset) = self.offset {
            query = query.with_offset(offset);
        }
        Ok(query)
    }
}

async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_from_headers(&headers);
    let owner = params.owner.clone();
    let queue = params.queue.clone();
    let query = params.into_query()?;

    let page = match (owner, queue) {
        (_, Some(queue)) => state.control.list_for_queue(&caller, &queue, query).await?,
        (Some(owner), None) => state.control.list_for_owner(&caller, &owner, query).await?,
        (None, None) => {
            // Default scope: the caller's own jobs
            let owner = caller.owner.clone().ok_or(Error::AuthRequired)?;
            state.control.list_for_owner(&caller, &owner, query).await?
        }
    };

    Ok(Json(json!({
        "jobs": page.jobs,
        "total": page.total,
    })))
}

/// Router for job routes
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/bulk-cancel", post(bulk_cancel))
        .route(
            "/jobs/:id",
            get(inspect_job).delete(cancel_job),
        )
        .route("/jobs/:id/retry", post(retry_job))
}
