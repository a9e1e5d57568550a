use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::app_state::{AdminState, AppState};
use crate::services::job_service::JobServiceError;

pub mod admin;
pub mod health;
pub mod jobs;
pub mod metrics;

/// Job creation and status-polling routes of the API server.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs", post(jobs::create_job))
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job_status))
        .route("/api/v1/users/{user_id}/jobs", get(jobs::list_user_jobs))
        .with_state(state)
}

/// Dependency health and reset routes of the worker process.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(admin::dependency_health))
        .route(
            "/admin/dependencies/{name}/reset",
            post(admin::reset_dependency),
        )
        .with_state(state)
}

/// Error returned by route handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl From<JobServiceError> for ApiError {
    fn from(e: JobServiceError) -> Self {
        match e {
            JobServiceError::Enqueue(_) => ApiError::Unavailable(e.to_string()),
            JobServiceError::Store(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => {
                tracing::error!(error = %m, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
