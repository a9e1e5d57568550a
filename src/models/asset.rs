use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// What a stored file represents within the extraction flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AssetKind {
    /// The uploaded photo (recorded by the upload flow, never by the pipeline)
    Original,
    /// S1 output: artwork recreated by the generative model
    Recreated,
    /// S3 output: background-free, print-normalized PNG
    Transparent,
}

/// Pixel and print metadata of a normalized image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub dpi: u32,
}

/// A stored file produced by a pipeline stage. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: Uuid,
    pub kind: AssetKind,
    pub owner_type: String,
    pub owner_id: Option<String>,
    pub file_location: String,
    pub content_type: String,
    pub byte_size: i64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub dpi: Option<u32>,
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAsset {
    pub kind: AssetKind,
    pub owner_id: Option<String>,
    pub file_location: String,
    pub content_type: String,
    pub byte_size: i64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub dpi: Option<u32>,
    pub job_id: Uuid,
}

/// Owner type recorded for every asset the pipeline creates.
pub const JOB_OWNER_TYPE: &str = "job";
