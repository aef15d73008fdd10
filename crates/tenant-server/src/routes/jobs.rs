//! Job Engine (C8) administration: enqueue, inspect, and cancel jobs.
//!
//! Leasing and execution happen in the background worker started from
//! `main`, not from HTTP — these routes are the operator-facing surface
//! over [`crate::jobs`]'s repository functions.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tenant_core::jobs::{Job, JobPriority};

use crate::error::ServerError;
use crate::state::AppState;

/// Build the jobs router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(enqueue))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/cancel", post(cancel))
        .route("/jobs/{job_id}/progress", post(update_progress))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    job_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    priority: Option<JobPriority>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    store_id: Option<Uuid>,
    #[serde(default)]
    user_id: Option<Uuid>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    dedupe_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    job_id: Uuid,
}

/// `POST /v1/jobs` — submit a job, deduplicating onto an already-live job
/// sharing `dedupe_key` if one exists.
async fn enqueue(
    State(state): State<AppState>,
    Json(body): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ServerError> {
    let now = Utc::now();
    let job = Job::enqueue(
        body.job_type,
        body.payload,
        body.priority.unwrap_or_default(),
        now,
        now,
        body.max_retries.unwrap_or(3),
        body.store_id,
        body.user_id,
        body.metadata.unwrap_or(serde_json::Value::Null),
        body.dedupe_key,
    )
    .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let job_id = crate::jobs::submit(&state.pool, &job).await.map_err(to_server_error)?;
    Ok(Json(EnqueueResponse { job_id }))
}

/// `GET /v1/jobs/{job_id}` — fetch a job's current state.
async fn get_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Result<Json<Job>, ServerError> {
    let job = crate::jobs::get(&state.pool, job_id).await.map_err(to_server_error)?;
    Ok(Json(job))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    job_id: Uuid,
}

/// `POST /v1/jobs/{job_id}/cancel` — request cancellation. Pending jobs
/// cancel immediately; running jobs move to `cancelling` and stop at their
/// next cooperative checkpoint.
async fn cancel(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Result<Json<CancelResponse>, ServerError> {
    crate::jobs::request_cancel(&state.pool, job_id, Utc::now()).await.map_err(to_server_error)?;
    Ok(Json(CancelResponse { job_id }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProgressRequest {
    progress: f32,
    #[serde(default)]
    message: Option<String>,
}

/// `POST /v1/jobs/{job_id}/progress` — record progress on a running job.
/// Intended for a handler running out-of-process to call back in, not for
/// routine operator use.
async fn update_progress(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(body): Json<UpdateProgressRequest>,
) -> Result<(), ServerError> {
    crate::jobs::update_progress(&state.pool, job_id, body.progress, body.message).await.map_err(to_server_error)
}

fn to_server_error(err: crate::jobs::JobsError) -> ServerError {
    use crate::jobs::JobsError as E;
    match err {
        E::NotFound(id) => ServerError::NotFound(format!("job not found: {id}")),
        E::Transition(inner) => inner.into(),
        E::Database(inner) => inner.into(),
    }
}
