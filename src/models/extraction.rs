use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::asset::{Asset, AssetKind};
use crate::models::job::{ExtractionJob, ExtractionResult, JobStatus};

/// Request to start an extraction for an already uploaded photo.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[garde(length(min = 1, max = 200))]
    pub upload_asset_id: String,

    #[garde(length(min = 1, max = 2048))]
    pub file_path: String,

    #[garde(length(min = 1, max = 200))]
    pub user_id: Option<String>,
}

/// Response after a job has been accepted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// Status-polling contract returned for a single job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub id: Uuid,
    pub status: JobStatus,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_data: Option<ExtractionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<AssetView>,
}

impl JobStatusResponse {
    pub fn from_job(job: ExtractionJob, assets: &[Asset]) -> Self {
        Self {
            id: job.id,
            status: job.status(),
            error_message: job.state.error_message().map(str::to_string),
            result_data: job.state.result().cloned(),
            logs: job.logs,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            assets: assets.iter().map(AssetView::from).collect(),
        }
    }
}

/// Asset reference exposed to polling clients once a job is done.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetView {
    pub id: Uuid,
    pub kind: AssetKind,
    pub file_location: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub dpi: Option<u32>,
}

impl From<&Asset> for AssetView {
    fn from(asset: &Asset) -> Self {
        Self {
            id: asset.id,
            kind: asset.kind,
            file_location: asset.file_location.clone(),
            width: asset.width,
            height: asset.height,
            dpi: asset.dpi,
        }
    }
}

/// Row of a user's job listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&ExtractionJob> for JobSummary {
    fn from(job: &ExtractionJob) -> Self {
        Self {
            id: job.id,
            status: job.status(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}
