//! Deployment job endpoints

use super::{ApiResult, AppState};
use crate::model::{ApiCallRecord, DeploymentJob, JobStatus};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Routes under `/api/jobs`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/:job_id", get(get_job).delete(delete_job))
        .route("/:job_id/cancel", post(cancel_job))
        .route("/:job_id/retry", post(retry_job))
        .route("/:job_id/logs", get(job_logs))
}

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    status_filter: Option<JobStatus>,
    peer_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub(super) struct JobListResponse {
    items: Vec<DeploymentJob>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct JobDetailResponse {
    #[serde(flatten)]
    job: DeploymentJob,
    api_call_logs: Vec<ApiCallRecord>,
}

pub(super) async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<JobListResponse> {
    let items = state.store.list_jobs(query.status_filter, query.peer_id);
    let total = items.len();
    Json(JobListResponse { items, total })
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobDetailResponse>> {
    let job = state.store.get_job(job_id)?;
    let api_call_logs = state.store.api_logs_for_job(job_id);
    Ok(Json(JobDetailResponse { job, api_call_logs }))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state.store.cancel_job(job_id)?;
    Ok(Json(serde_json::json!({
        "message": "Job cancelled",
        "job_id": job.id,
    })))
}

async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state.store.get_job(job_id)?;
    if job.status != JobStatus::Failed {
        return Err(super::ApiError::bad_request("Can only retry failed jobs"));
    }
    let new_job = state.engine.start_apply(job.peer_id, job.created_by)?;
    Ok(Json(serde_json::json!({
        "message": "New deployment job created",
        "original_job_id": job.id,
        "new_job_id": new_job.id,
    })))
}

async fn job_logs(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state.store.get_job(job_id)?;
    let logs = state.store.api_logs_for_job(job_id);
    let total = logs.len();
    Ok(Json(serde_json::json!({
        "job_id": job.id,
        "logs": logs,
        "total": total,
    })))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.store.delete_job(job_id)?;
    Ok(StatusCode::NO_CONTENT)
}
