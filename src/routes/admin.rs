use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use crate::app_state::AdminState;
use crate::routes::ApiError;
use crate::services::circuit_breaker::CircuitState;
use crate::services::health_registry::{Dependency, DependencyReport};

#[derive(Serialize)]
pub struct DependencyHealthResponse {
    pub status: String,
    pub dependencies: Vec<DependencyReport>,
}

#[derive(Serialize)]
pub struct ResetResponse {
    pub dependency: Dependency,
    pub status: String,
}

/// GET /health — breaker state and sticky flag of every dependency.
pub async fn dependency_health(State(state): State<AdminState>) -> Json<DependencyHealthResponse> {
    let dependencies = state.registry.report();
    let healthy = dependencies
        .iter()
        .all(|d| !d.exhausted && d.breaker.state == CircuitState::Closed);

    Json(DependencyHealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        dependencies,
    })
}

/// POST /admin/dependencies/{name}/reset — clear the sticky flag and close
/// the breaker.
pub async fn reset_dependency(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<ResetResponse>, ApiError> {
    let dependency = state
        .registry
        .reset_by_name(&name)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown dependency: {name}")))?;

    tracing::warn!(dependency = %dependency, "Dependency reset by operator");
    Ok(Json(ResetResponse {
        dependency,
        status: "reset".to_string(),
    }))
}
