use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::extraction::{CreateJobRequest, CreateJobResponse, JobStatusResponse, JobSummary};
use crate::models::job::JobStatus;
use crate::routes::ApiError;

/// POST /api/v1/jobs — start an extraction for an uploaded photo.
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    request
        .validate()
        .map_err(|report| ApiError::Validation(report.to_string()))?;

    let job_id = state
        .jobs
        .create_job(
            &request.upload_asset_id,
            &request.file_path,
            request.user_id.as_deref(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id,
            status: JobStatus::Queued,
            message: "Extraction job queued".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id} — poll a job's status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let not_found = || ApiError::NotFound("Job not found".to_string());
    let job_id = Uuid::parse_str(&job_id).map_err(|_| not_found())?;

    state
        .jobs
        .get_job_status(job_id)
        .await?
        .map(Json)
        .ok_or_else(not_found)
}

/// GET /api/v1/users/{user_id}/jobs — a user's latest jobs.
pub async fn list_user_jobs(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<JobSummary>>, ApiError> {
    Ok(Json(state.jobs.list_user_jobs(&user_id).await?))
}
