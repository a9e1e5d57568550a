use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub queue_depth: Option<u64>,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn ok(started: std::time::Instant) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
            error: Some(error),
        }
    }
}

/// GET /health — database and Redis connectivity.
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let db_check = match state.jobs.store().health_check().await {
        Ok(()) => ComponentHealth::ok(start),
        Err(e) => ComponentHealth::failed(e.to_string()),
    };

    let redis_start = std::time::Instant::now();
    let redis_check = match state.jobs.queue().health_check().await {
        Ok(()) => ComponentHealth::ok(redis_start),
        Err(e) => ComponentHealth::failed(e.to_string()),
    };

    let queue_depth = state.jobs.queue().depth().await.ok();
    if let Some(depth) = queue_depth {
        metrics::gauge!("extraction_queue_depth").set(depth as f64);
    }

    let all_healthy = db_check.status == "ok" && redis_check.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue_depth,
        checks: HealthChecks {
            database: db_check,
            redis: redis_check,
        },
    };

    (status_code, Json(response))
}
