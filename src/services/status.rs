//! Status polling contract.
//!
//! Progress is reported only through the job's log trail. Each pipeline
//! stage appends its marker before it runs, and [`progress_hint`] turns the
//! latest marker into a display percentage. The percentage is a hint for
//! UIs, not part of the contract.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::models::extraction::JobStatusResponse;
use crate::models::job::JobStatus;

pub const JOB_CREATED: &str = "Job created";
pub const EXTRACTION_STARTED: &str = "Starting extraction";
pub const STEP_RECREATE: &str = "Step 1: recreating artwork";
pub const STEP_REMOVE_BACKGROUND: &str = "Step 2: removing background";
pub const STEP_VERIFY: &str = "Step 4: verifying print quality";
pub const EXTRACTION_COMPLETED: &str = "Extraction completed";

pub fn step_normalize(dpi: u32) -> String {
    format!("Step 3: normalizing to {dpi} DPI")
}

/// Display percentage for a job, inferred from its status and logs.
pub fn progress_hint(status: JobStatus, logs: &[String]) -> u8 {
    if status.is_terminal() {
        return 100;
    }
    let latest_step = logs.iter().rev().find_map(|entry| {
        let entry = entry.to_ascii_lowercase();
        ["step 4", "step 3", "step 2", "step 1"]
            .iter()
            .position(|marker| entry.starts_with(marker))
    });
    match latest_step {
        Some(0) => 95,
        Some(1) => 80,
        Some(2) => 60,
        Some(3) => 35,
        _ => 15,
    }
}

/// Anything that can answer a status poll.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// `Ok(None)` means the job does not exist.
    async fn fetch_status(&self, job_id: Uuid) -> Result<Option<JobStatusResponse>, StatusError>;
}

/// Polls the API server's `GET /api/v1/jobs/{id}`.
pub struct HttpStatusClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpStatusClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StatusSource for HttpStatusClient {
    async fn fetch_status(&self, job_id: Uuid) -> Result<Option<JobStatusResponse>, StatusError> {
        let response = self
            .http
            .get(format!("{}/api/v1/jobs/{}", self.base_url, job_id))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.json().await?))
    }
}

/// Latest observation published by a [`StatusPoller`].
#[derive(Debug, Clone)]
pub enum PollUpdate {
    Pending,
    Snapshot(JobStatusResponse),
}

/// Why a [`StatusPoller`] stopped.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Terminal(JobStatusResponse),
    NotFound,
    Failed(String),
    Cancelled,
}

/// Polls one job on a fixed interval until it reaches a terminal status.
///
/// Dropping the poller cancels it.
pub struct StatusPoller {
    handle: JoinHandle<PollOutcome>,
    updates: watch::Receiver<PollUpdate>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl StatusPoller {
    pub fn spawn(source: Arc<dyn StatusSource>, job_id: Uuid, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let (tx, updates) = watch::channel(PollUpdate::Pending);
        let handle = tokio::spawn(poll_until_terminal(
            source,
            job_id,
            interval,
            tx,
            cancel.clone(),
        ));

        Self {
            handle,
            updates,
            _guard: cancel.clone().drop_guard(),
            cancel,
        }
    }

    pub fn updates(&self) -> watch::Receiver<PollUpdate> {
        self.updates.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the polling task to stop.
    pub async fn finished(self) -> PollOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => PollOutcome::Failed(format!("status poller task failed: {e}")),
        }
    }
}

async fn poll_until_terminal(
    source: Arc<dyn StatusSource>,
    job_id: Uuid,
    period: Duration,
    tx: watch::Sender<PollUpdate>,
    cancel: CancellationToken,
) -> PollOutcome {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = ticker.tick() => {}
        }

        match source.fetch_status(job_id).await {
            Ok(Some(snapshot)) => {
                let terminal = snapshot.status.is_terminal();
                tracing::debug!(
                    job_id = %job_id,
                    status = %snapshot.status,
                    progress = progress_hint(snapshot.status, &snapshot.logs),
                    "Polled job status"
                );
                tx.send_replace(PollUpdate::Snapshot(snapshot.clone()));
                if terminal {
                    return PollOutcome::Terminal(snapshot);
                }
            }
            Ok(None) => return PollOutcome::NotFound,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Status poll failed");
                return PollOutcome::Failed(e.to_string());
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Status lookup failed: {0}")]
    Source(String),
}
