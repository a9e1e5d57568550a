use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::extraction::{JobStatusResponse, JobSummary};
use crate::models::job::{JobStatus, NewJob};
use crate::services::queue::{ExtractionTask, QueueError, WorkQueue};
use crate::services::retry::{retry_with_backoff, Backoff};
use crate::services::status::{StatusError, StatusSource, JOB_CREATED};

/// Producer-facing side of the pipeline: creates jobs and answers status
/// reads. Never waits on processing.
pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    enqueue_backoff: Backoff,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>, enqueue_backoff: Backoff) -> Self {
        Self {
            store,
            queue,
            enqueue_backoff,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// Insert a queued job and enqueue its work item. If the item cannot be
    /// enqueued the job row is removed again and creation fails.
    pub async fn create_job(
        &self,
        upload_asset_id: &str,
        source_file_ref: &str,
        user_id: Option<&str>,
    ) -> Result<Uuid, JobServiceError> {
        let job = self
            .store
            .insert_job(
                &NewJob {
                    upload_asset_id: upload_asset_id.to_string(),
                    user_id: user_id.map(str::to_string),
                    source_file_ref: source_file_ref.to_string(),
                },
                JOB_CREATED,
            )
            .await?;

        let task = ExtractionTask {
            job_id: job.id,
            upload_asset_id: job.upload_asset_id.clone(),
            source_file_ref: job.source_file_ref.clone(),
            user_id: job.user_id.clone(),
        };

        let enqueued = retry_with_backoff(self.enqueue_backoff, |attempt| {
            tracing::debug!(job_id = %job.id, attempt, "Enqueuing extraction task");
            self.queue.enqueue(&task)
        })
        .await;

        if let Err(e) = enqueued {
            tracing::error!(job_id = %job.id, error = %e, "Enqueue failed, rolling back job");
            if let Err(cleanup) = self.store.delete_job(job.id).await {
                tracing::error!(job_id = %job.id, error = %cleanup, "Failed to remove unqueued job");
            }
            return Err(JobServiceError::Enqueue(e));
        }

        metrics::counter!("extraction_jobs_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            upload_asset_id = %upload_asset_id,
            "Extraction job queued"
        );
        Ok(job.id)
    }

    /// Current snapshot of a job, with its assets once it is done.
    pub async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatusResponse>, JobServiceError> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(None);
        };
        let assets = if job.status() == JobStatus::Done {
            self.store.list_assets(job_id).await?
        } else {
            Vec::new()
        };
        Ok(Some(JobStatusResponse::from_job(job, &assets)))
    }

    pub async fn list_user_jobs(&self, user_id: &str) -> Result<Vec<JobSummary>, JobServiceError> {
        let jobs = self.store.list_jobs_for_user(user_id).await?;
        Ok(jobs.iter().map(JobSummary::from).collect())
    }
}

#[async_trait]
impl StatusSource for JobService {
    async fn fetch_status(&self, job_id: Uuid) -> Result<Option<JobStatusResponse>, StatusError> {
        self.get_job_status(job_id)
            .await
            .map_err(|e| StatusError::Source(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to enqueue job: {0}")]
    Enqueue(#[from] QueueError),
}
