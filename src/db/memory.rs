use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::{JobStore, StoreError, USER_JOB_LIMIT};
use crate::models::asset::{Asset, NewAsset, JOB_OWNER_TYPE};
use crate::models::job::{ExtractionJob, ExtractionResult, JobState, JobStatus, NewJob};

/// In-process job store with the same transition rules as
/// [`PgJobStore`](crate::db::PgJobStore).
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, ExtractionJob>>,
    assets: RwLock<Vec<Asset>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `change` to a job if it may move to `to`.
    fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        change: impl FnOnce(&mut ExtractionJob),
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let from = job.status();
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { job_id, from, to });
        }
        change(job);
        let now = Utc::now();
        job.updated_at = now;
        if to.is_terminal() {
            job.completed_at = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: &NewJob, first_log: &str) -> Result<ExtractionJob, StoreError> {
        let now = Utc::now();
        let record = ExtractionJob {
            id: Uuid::new_v4(),
            state: JobState::Queued,
            logs: vec![first_log.to_string()],
            upload_asset_id: job.upload_asset_id.clone(),
            user_id: job.user_id.clone(),
            source_file_ref: job.source_file_ref.clone(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.jobs.write().insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, StoreError> {
        Ok(self.jobs.read().get(&job_id).cloned())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        match jobs.get(&job_id).map(ExtractionJob::status) {
            None => Err(StoreError::NotFound(job_id)),
            Some(JobStatus::Queued) => {
                jobs.remove(&job_id);
                Ok(())
            }
            Some(status) => Err(StoreError::NotDeletable { job_id, status }),
        }
    }

    async fn mark_running(&self, job_id: Uuid, log: &str) -> Result<(), StoreError> {
        self.transition(job_id, JobStatus::Running, |job| {
            job.state = JobState::Running;
            job.logs.push(log.to_string());
        })
    }

    async fn append_log(&self, job_id: Uuid, log: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let from = job.status();
        if from != JobStatus::Running {
            return Err(StoreError::InvalidTransition {
                job_id,
                from,
                to: JobStatus::Running,
            });
        }
        job.logs.push(log.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_done(
        &self,
        job_id: Uuid,
        result: &ExtractionResult,
        log: &str,
    ) -> Result<(), StoreError> {
        self.transition(job_id, JobStatus::Done, |job| {
            job.state = JobState::Done {
                result: result.clone(),
            };
            job.logs.push(log.to_string());
        })
    }

    async fn mark_error(&self, job_id: Uuid, message: &str) -> Result<(), StoreError> {
        self.transition(job_id, JobStatus::Error, |job| {
            job.state = JobState::Error {
                message: message.to_string(),
            };
        })
    }

    async fn insert_asset(&self, asset: &NewAsset) -> Result<Asset, StoreError> {
        if !self.jobs.read().contains_key(&asset.job_id) {
            return Err(StoreError::NotFound(asset.job_id));
        }
        let record = Asset {
            id: Uuid::new_v4(),
            kind: asset.kind,
            owner_type: JOB_OWNER_TYPE.to_string(),
            owner_id: asset.owner_id.clone(),
            file_location: asset.file_location.clone(),
            content_type: asset.content_type.clone(),
            byte_size: asset.byte_size,
            width: asset.width,
            height: asset.height,
            dpi: asset.dpi,
            job_id: asset.job_id,
            created_at: Utc::now(),
        };
        self.assets.write().push(record.clone());
        Ok(record)
    }

    async fn list_assets(&self, job_id: Uuid) -> Result<Vec<Asset>, StoreError> {
        Ok(self
            .assets
            .read()
            .iter()
            .filter(|asset| asset.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_jobs_for_user(&self, user_id: &str) -> Result<Vec<ExtractionJob>, StoreError> {
        let mut jobs: Vec<ExtractionJob> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(USER_JOB_LIMIT as usize);
        Ok(jobs)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
