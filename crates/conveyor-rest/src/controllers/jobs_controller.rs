//! Job submission and status REST API controller.

use crate::extractors::ApiJson;
use crate::responses::{accepted, ApiResult, AppError};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use conveyor_core::ConveyorError;
use conveyor_jobs::{JobArguments, JobId, JobStatus, KindDescriptor};
use serde::{Deserialize, Serialize};

/// Create the jobs router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:job_id", get(get_job_status))
        .route("/kinds", get(list_kinds))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Body of `POST /jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    /// Registered kind name.
    pub kind: String,
    /// Named arguments for the handler.
    #[serde(default)]
    pub arguments: JobArguments,
    /// Producer-chosen id; a fresh one is generated when absent.
    #[serde(default)]
    pub job_id: Option<String>,
}

/// Response for an accepted submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: String,
}

/// Response for kind listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct KindsResponse {
    pub kinds: Vec<KindDescriptor>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Enqueue a job. Returns 202 with the job id; the job runs later.
pub async fn submit_job(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let job_id = match request.job_id {
        Some(id) if id.trim().is_empty() => {
            return Err(AppError(ConveyorError::validation("job_id must not be empty")));
        }
        Some(id) => {
            state
                .dispatcher
                .enqueue_with_id(JobId::from(id), &request.kind, request.arguments)
                .await?
        }
        None => state.dispatcher.enqueue(&request.kind, request.arguments).await?,
    };

    Ok(accepted(SubmitJobResponse {
        job_id: job_id.to_string(),
        status: JobStatus::Pending.name().to_string(),
    }))
}

/// Current status of a job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatus>> {
    let status = state.resolver.status(&JobId::from(job_id)).await?;
    Ok(Json(status))
}

/// Registered kinds with their parameters and deadlines.
pub async fn list_kinds(State(state): State<AppState>) -> Json<KindsResponse> {
    Json(KindsResponse {
        kinds: state.registry.kinds(),
    })
}
