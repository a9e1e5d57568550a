use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::{JobStore, StoreError, USER_JOB_LIMIT};
use crate::models::asset::{Asset, AssetKind, NewAsset, JOB_OWNER_TYPE};
use crate::models::job::{ExtractionJob, ExtractionResult, JobState, JobStatus, NewJob};

const JOB_COLUMNS: &str = "id, status, logs, error_message, result_data, upload_asset_id, \
                           user_id, source_file_ref, created_at, updated_at, completed_at";

const ASSET_COLUMNS: &str = "id, kind, owner_type, owner_id, file_location, content_type, \
                             byte_size, width, height, dpi, job_id, created_at";

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain why a guarded update matched no row.
    async fn rejected(&self, job_id: Uuid, to: JobStatus) -> StoreError {
        match self.get_job(job_id).await {
            Ok(Some(job)) => StoreError::InvalidTransition {
                job_id,
                from: job.status(),
                to,
            },
            Ok(None) => StoreError::NotFound(job_id),
            Err(e) => e,
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<ExtractionJob, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status: JobStatus = status
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("job {id} has unknown status {status:?}")))?;

    let state = match status {
        JobStatus::Queued => JobState::Queued,
        JobStatus::Running => JobState::Running,
        JobStatus::Done => {
            let value: Option<serde_json::Value> = row.try_get("result_data")?;
            let value =
                value.ok_or_else(|| StoreError::Corrupt(format!("done job {id} has no result")))?;
            let result: ExtractionResult = serde_json::from_value(value)
                .map_err(|e| StoreError::Corrupt(format!("job {id} result: {e}")))?;
            JobState::Done { result }
        }
        JobStatus::Error => {
            let message: Option<String> = row.try_get("error_message")?;
            JobState::Error {
                message: message.unwrap_or_default(),
            }
        }
    };

    Ok(ExtractionJob {
        id,
        state,
        logs: row.try_get("logs")?,
        upload_asset_id: row.try_get("upload_asset_id")?,
        user_id: row.try_get("user_id")?,
        source_file_ref: row.try_get("source_file_ref")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn dimension(row: &PgRow, column: &str) -> Result<Option<u32>, StoreError> {
    let value: Option<i32> = row.try_get(column)?;
    Ok(value.and_then(|v| u32::try_from(v).ok()))
}

fn asset_from_row(row: &PgRow) -> Result<Asset, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(Asset {
        id: row.try_get("id")?,
        kind: kind
            .parse::<AssetKind>()
            .map_err(|_| StoreError::Corrupt(format!("unknown asset kind {kind:?}")))?,
        owner_type: row.try_get("owner_type")?,
        owner_id: row.try_get("owner_id")?,
        file_location: row.try_get("file_location")?,
        content_type: row.try_get("content_type")?,
        byte_size: row.try_get("byte_size")?,
        width: dimension(row, "width")?,
        height: dimension(row, "height")?,
        dpi: dimension(row, "dpi")?,
        job_id: row.try_get("job_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn to_column(value: Option<u32>) -> Option<i32> {
    value.and_then(|v| i32::try_from(v).ok())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, job: &NewJob, first_log: &str) -> Result<ExtractionJob, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO extraction_jobs (status, logs, upload_asset_id, user_id, source_file_ref)
            VALUES ('queued', ARRAY[$1], $2, $3, $4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(first_log)
        .bind(&job.upload_asset_id)
        .bind(job.user_id.as_deref())
        .bind(&job.source_file_ref)
        .fetch_one(&self.pool)
        .await?;

        job_from_row(&row)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM extraction_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let deleted = sqlx::query("DELETE FROM extraction_jobs WHERE id = $1 AND status = 'queued'")
            .bind(job_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted == 0 {
            return Err(match self.get_job(job_id).await? {
                Some(job) => StoreError::NotDeletable {
                    job_id,
                    status: job.status(),
                },
                None => StoreError::NotFound(job_id),
            });
        }
        Ok(())
    }

    async fn mark_running(&self, job_id: Uuid, log: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET status = 'running',
                logs = array_append(logs, $2),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(job_id)
        .bind(log)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.rejected(job_id, JobStatus::Running).await);
        }
        Ok(())
    }

    async fn append_log(&self, job_id: Uuid, log: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET logs = array_append(logs, $2),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(log)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.rejected(job_id, JobStatus::Running).await);
        }
        Ok(())
    }

    async fn mark_done(
        &self,
        job_id: Uuid,
        result: &ExtractionResult,
        log: &str,
    ) -> Result<(), StoreError> {
        let result = serde_json::to_value(result)
            .map_err(|e| StoreError::Corrupt(format!("job {job_id} result: {e}")))?;

        let updated = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET status = 'done',
                result_data = $2,
                logs = array_append(logs, $3),
                updated_at = NOW(),
                completed_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(result)
        .bind(log)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.rejected(job_id, JobStatus::Done).await);
        }
        Ok(())
    }

    async fn mark_error(&self, job_id: Uuid, message: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET status = 'error',
                error_message = $2,
                updated_at = NOW(),
                completed_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(message)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.rejected(job_id, JobStatus::Error).await);
        }
        Ok(())
    }

    async fn insert_asset(&self, asset: &NewAsset) -> Result<Asset, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO assets (kind, owner_type, owner_id, file_location, content_type,
                                byte_size, width, height, dpi, job_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {ASSET_COLUMNS}
            "#
        ))
        .bind(asset.kind.to_string())
        .bind(JOB_OWNER_TYPE)
        .bind(asset.owner_id.as_deref())
        .bind(&asset.file_location)
        .bind(&asset.content_type)
        .bind(asset.byte_size)
        .bind(to_column(asset.width))
        .bind(to_column(asset.height))
        .bind(to_column(asset.dpi))
        .bind(asset.job_id)
        .fetch_one(&self.pool)
        .await?;

        asset_from_row(&row)
    }

    async fn list_assets(&self, job_id: Uuid) -> Result<Vec<Asset>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE job_id = $1 ORDER BY created_at"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(asset_from_row).collect()
    }

    async fn list_jobs_for_user(&self, user_id: &str) -> Result<Vec<ExtractionJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM extraction_jobs
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(user_id)
        .bind(USER_JOB_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
