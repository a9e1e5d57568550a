use std::sync::Arc;

use crate::services::health_registry::DependencyHealthRegistry;
use crate::services::job_service::JobService;

/// Shared state of the API server's route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobService>,
}

impl AppState {
    pub fn new(jobs: JobService) -> Self {
        Self {
            jobs: Arc::new(jobs),
        }
    }
}

/// Shared state of the worker's admin surface.
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<DependencyHealthRegistry>,
}
