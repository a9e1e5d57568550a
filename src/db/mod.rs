use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::asset::{Asset, NewAsset};
use crate::models::job::{ExtractionJob, ExtractionResult, JobStatus, NewJob};

pub mod memory;
pub mod queries;

pub use memory::MemoryJobStore;
pub use queries::PgJobStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Number of jobs returned by a user listing.
pub const USER_JOB_LIMIT: i64 = 50;

/// Durable record of job lifecycle state and produced assets.
///
/// Status-changing methods enforce [`JobStatus::can_transition_to`]: a
/// transition the state machine forbids changes nothing and returns
/// [`StoreError::InvalidTransition`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job in `queued` with the initial log entry.
    async fn insert_job(&self, job: &NewJob, first_log: &str) -> Result<ExtractionJob, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, StoreError>;

    /// Remove a job that never reached a worker. Only `queued` jobs can be
    /// deleted.
    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn mark_running(&self, job_id: Uuid, log: &str) -> Result<(), StoreError>;

    /// Append a progress entry to a running job.
    async fn append_log(&self, job_id: Uuid, log: &str) -> Result<(), StoreError>;

    async fn mark_done(
        &self,
        job_id: Uuid,
        result: &ExtractionResult,
        log: &str,
    ) -> Result<(), StoreError>;

    async fn mark_error(&self, job_id: Uuid, message: &str) -> Result<(), StoreError>;

    async fn insert_asset(&self, asset: &NewAsset) -> Result<Asset, StoreError>;

    async fn list_assets(&self, job_id: Uuid) -> Result<Vec<Asset>, StoreError>;

    /// Latest jobs of a user, newest first.
    async fn list_jobs_for_user(&self, user_id: &str) -> Result<Vec<ExtractionJob>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} is {status} and can no longer be deleted")]
    NotDeletable { job_id: Uuid, status: JobStatus },

    #[error("Corrupt job record: {0}")]
    Corrupt(String),
}
