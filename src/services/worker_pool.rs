use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::StoreError;
use crate::models::job::JobStatus;
use crate::services::pipeline::{ExtractionPipeline, PipelineError, PipelineOutcome};
use crate::services::queue::{Lease, QueueError, StalledSweep, WorkQueue};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    /// Idle sleep between empty dequeues
    pub poll_interval: Duration,
    pub lock_duration: Duration,
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
}

const STALL_RECOVERY_LOG: &str = "Recovering stalled job";

/// Fixed-size pool of workers, each running one job at a time through the
/// extraction pipeline, plus the stalled-item detector.
pub struct WorkerPool {
    queue: Arc<dyn WorkQueue>,
    pipeline: Arc<ExtractionPipeline>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        pipeline: Arc<ExtractionPipeline>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            pipeline,
            config,
        }
    }

    /// Run the workers and the stalled detector until `shutdown` is
    /// cancelled. Workers finish the job in hand before exiting.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();
        for worker_id in 0..self.config.concurrency.max(1) {
            tasks.spawn(self.clone().worker_loop(worker_id, shutdown.clone()));
        }
        tasks.spawn(self.clone().stalled_detector(shutdown.clone()));

        tracing::info!(concurrency = self.config.concurrency, "Worker pool started");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            match self.process_next(worker_id).await {
                Ok(true) => {
                    tracing::debug!(worker_id, "Job processed, checking for next job");
                    continue;
                }
                Ok(false) => tracing::trace!(worker_id, "No jobs available, sleeping"),
                Err(e) => tracing::error!(worker_id, error = %e, "Error processing job, will retry"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.poll_interval) => {}
            }
        }
        tracing::info!(worker_id, "Worker stopped");
    }

    async fn stalled_detector(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.stalled_interval) => {}
            }
            if let Err(e) = self.sweep_stalled().await {
                tracing::error!(error = %e, "Stalled job sweep failed");
            }
        }
    }

    /// Dequeue and process one job. Returns `Ok(false)` when the queue is
    /// empty.
    pub async fn process_next(&self, worker_id: usize) -> Result<bool, WorkerError> {
        let Some(lease) = self.queue.dequeue().await? else {
            return Ok(false);
        };
        let job_id = lease.task.job_id;
        tracing::info!(
            worker_id,
            job_id = %job_id,
            upload_asset_id = %lease.task.upload_asset_id,
            stalled_count = lease.stalled_count,
            "Processing extraction job"
        );

        let lease_lost = CancellationToken::new();
        let finished = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            self.queue.clone(),
            lease.clone(),
            self.config.lock_duration / 3,
            lease_lost.clone(),
            finished.clone(),
        ));

        let started = Instant::now();
        let outcome = self.pipeline.run(&lease.task, &lease_lost).await;
        finished.cancel();
        if let Err(e) = heartbeat.await {
            tracing::warn!(job_id = %job_id, error = %e, "Heartbeat task failed");
        }

        match outcome? {
            PipelineOutcome::Done(_) => {
                metrics::counter!("extraction_jobs_completed").increment(1);
                metrics::histogram!("extraction_processing_seconds")
                    .record(started.elapsed().as_secs_f64());
            }
            PipelineOutcome::Failed(_) => {
                metrics::counter!("extraction_jobs_failed").increment(1);
            }
            PipelineOutcome::AlreadyFinished(_) => {}
            PipelineOutcome::LeaseLost => return Ok(true),
        }

        if !self.queue.complete(&lease).await? {
            tracing::warn!(job_id = %job_id, "Lease expired before completion");
        }
        Ok(true)
    }

    /// Redeliver expired leases and fail jobs that stalled too often.
    pub async fn sweep_stalled(&self) -> Result<StalledSweep, WorkerError> {
        let sweep = self.queue.recover_stalled().await?;

        for job_id in &sweep.redelivered {
            tracing::warn!(job_id = %job_id, "Stalled job redelivered");
        }
        for job_id in &sweep.failed {
            self.fail_stalled(*job_id).await?;
        }

        let depth = self.queue.depth().await?;
        metrics::gauge!("extraction_queue_depth").set(depth as f64);
        Ok(sweep)
    }

    async fn fail_stalled(&self, job_id: Uuid) -> Result<(), WorkerError> {
        let store = self.pipeline.store();
        let message = format!("job stalled more than {} times", self.config.max_stalled_count);
        tracing::error!(job_id = %job_id, error = %message, "Stalled job failed permanently");

        let Some(job) = store.get_job(job_id).await? else {
            return Ok(());
        };
        if job.status() == JobStatus::Queued {
            store.mark_running(job_id, STALL_RECOVERY_LOG).await?;
        }
        match store.mark_error(job_id, &message).await {
            Ok(()) => {
                metrics::counter!("extraction_jobs_failed").increment(1);
                Ok(())
            }
            Err(StoreError::InvalidTransition { from, .. }) => {
                tracing::debug!(job_id = %job_id, status = %from, "Stalled job already finished");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Renew `lease` every `every` until `finished`. Cancels `lease_lost` when
/// the queue reports the lease gone.
async fn heartbeat(
    queue: Arc<dyn WorkQueue>,
    lease: Lease,
    every: Duration,
    lease_lost: CancellationToken,
    finished: CancellationToken,
) {
    let job_id = lease.task.job_id;
    loop {
        tokio::select! {
            _ = finished.cancelled() => return,
            _ = sleep(every) => {}
        }
        match queue.renew(&lease).await {
            Ok(true) => tracing::trace!(job_id = %job_id, "Lease renewed"),
            Ok(false) => {
                tracing::warn!(job_id = %job_id, "Lease lost");
                lease_lost.cancel();
                return;
            }
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Lease renewal failed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}
