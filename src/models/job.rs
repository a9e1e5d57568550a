use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::asset::ImageMetadata;

/// Lifecycle status of an extraction job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Status only moves forward. `Running -> Running` is accepted so a
    /// redelivered item can re-enter the pipeline.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Error)
        )
    }
}

/// Current state of a job. The result and the error message live on the
/// variant they belong to, so a job can never carry both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done { result: ExtractionResult },
    Error { message: String },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Queued => JobStatus::Queued,
            JobState::Running => JobStatus::Running,
            JobState::Done { .. } => JobStatus::Done,
            JobState::Error { .. } => JobStatus::Error,
        }
    }

    pub fn result(&self) -> Option<&ExtractionResult> {
        match self {
            JobState::Done { result } => Some(result),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            JobState::Error { message } => Some(message),
            _ => None,
        }
    }
}

/// Payload attached to a job once every pipeline stage has succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub original_asset_id: String,
    pub recreated_asset_id: Uuid,
    pub transparent_asset_id: Uuid,
    pub transparent_location: String,
    pub metadata: ImageMetadata,
}

/// A tracked artwork extraction job.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub state: JobState,
    pub logs: Vec<String>,
    pub upload_asset_id: String,
    pub user_id: Option<String>,
    pub source_file_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExtractionJob {
    pub fn status(&self) -> JobStatus {
        self.state.status()
    }
}

/// Fields supplied when a job row is first inserted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub upload_asset_id: String,
    pub user_id: Option<String>,
    pub source_file_ref: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_only_move_forward() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Done));
        assert!(Running.can_transition_to(Error));

        assert!(!Running.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Done));
        for terminal in [Done, Error] {
            for next in [Queued, Running, Done, Error] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_parses_from_column_value() {
        assert_eq!("running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert_eq!(JobStatus::Done.to_string(), "done");
        assert!("processing".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_state_exposes_only_its_own_payload() {
        let state = JobState::Error {
            message: "boom".into(),
        };
        assert_eq!(state.status(), JobStatus::Error);
        assert_eq!(state.error_message(), Some("boom"));
        assert!(state.result().is_none());
        assert!(JobState::Running.error_message().is_none());
    }
}
