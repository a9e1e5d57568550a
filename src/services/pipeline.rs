//! The four-stage extraction pipeline run by workers for each job.
//!
//! S1 recreates the artwork with the generative model, S2 removes the
//! background, S3 normalizes the result for print and S4 reads the stored
//! artifact back to verify it. Every stage appends its log marker before it
//! starts, and the first failing stage ends the job in `error`.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::asset::{AssetKind, NewAsset};
use crate::models::job::{ExtractionResult, JobStatus};
use crate::services::background_removal::BackgroundRemovalClient;
use crate::services::capability::{guarded_call, CapabilityError};
use crate::services::generative::GenerativeImageClient;
use crate::services::health_registry::{Dependency, DependencyHealthRegistry};
use crate::services::normalizer::{read_metadata, ImageNormalizer, NormalizeError};
use crate::services::queue::ExtractionTask;
use crate::services::status::{
    step_normalize, EXTRACTION_COMPLETED, EXTRACTION_STARTED, STEP_RECREATE,
    STEP_REMOVE_BACKGROUND, STEP_VERIFY,
};
use crate::services::storage::AssetStorage;

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Done(ExtractionResult),
    /// The job was marked `error` with this message.
    Failed(String),
    /// Another worker owns the job now. Nothing was written after the
    /// lease was lost.
    LeaseLost,
    /// The job had already reached a terminal status.
    AlreadyFinished(JobStatus),
}

pub struct ExtractionPipeline {
    store: Arc<dyn JobStore>,
    storage: Arc<dyn AssetStorage>,
    registry: Arc<DependencyHealthRegistry>,
    generator: GenerativeImageClient,
    remover: BackgroundRemovalClient,
    normalizer: ImageNormalizer,
    http: reqwest::Client,
    call_timeout: Duration,
}

impl ExtractionPipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        storage: Arc<dyn AssetStorage>,
        registry: Arc<DependencyHealthRegistry>,
        generator: GenerativeImageClient,
        remover: BackgroundRemovalClient,
        normalizer: ImageNormalizer,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            storage,
            registry,
            generator,
            remover,
            normalizer,
            http: reqwest::Client::new(),
            call_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Run every stage for `task`. `lease_lost` is cancelled by the worker's
    /// heartbeat when the queue lease can no longer be renewed.
    pub async fn run(
        &self,
        task: &ExtractionTask,
        lease_lost: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let job_id = task.job_id;

        match self.store.mark_running(job_id, EXTRACTION_STARTED).await {
            Ok(()) => {}
            Err(StoreError::InvalidTransition { from, .. }) => {
                tracing::warn!(job_id = %job_id, status = %from, "Job already finished, skipping");
                return Ok(PipelineOutcome::AlreadyFinished(from));
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(job_id = %job_id, source = %task.source_file_ref, "Starting extraction");

        let stages = self.run_stages(task, lease_lost).await;
        if lease_lost.is_cancelled() {
            tracing::warn!(job_id = %job_id, "Lease lost, abandoning job");
            return Ok(PipelineOutcome::LeaseLost);
        }

        let written = match stages {
            Ok(result) => self
                .store
                .mark_done(job_id, &result, EXTRACTION_COMPLETED)
                .await
                .map(|()| {
                    tracing::info!(
                        job_id = %job_id,
                        width = result.metadata.width,
                        height = result.metadata.height,
                        dpi = result.metadata.dpi,
                        "Extraction completed"
                    );
                    PipelineOutcome::Done(result)
                }),
            Err(PipelineError::Store(e)) if finished_status(&e).is_some() => Err(e),
            Err(e) => {
                let message = e.to_string();
                tracing::error!(job_id = %job_id, error = %message, "Extraction failed");
                self.store
                    .mark_error(job_id, &message)
                    .await
                    .map(|()| PipelineOutcome::Failed(message))
            }
        };

        match written {
            Ok(outcome) => Ok(outcome),
            Err(e) => match finished_status(&e) {
                Some(status) => {
                    tracing::warn!(job_id = %job_id, status = %status, "Job finished elsewhere, dropping result");
                    Ok(PipelineOutcome::AlreadyFinished(status))
                }
                None => Err(e.into()),
            },
        }
    }

    async fn run_stages(
        &self,
        task: &ExtractionTask,
        lease_lost: &CancellationToken,
    ) -> Result<ExtractionResult, PipelineError> {
        let job_id = task.job_id;

        self.enter_stage(job_id, STEP_RECREATE, lease_lost).await?;
        let source = self.load_source(&task.source_file_ref).await?;
        let recreated = self.generator.recreate(&source).await?;
        let recreated_asset_id = self
            .persist(task, AssetKind::Recreated, "recreated", &recreated, lease_lost)
            .await?;

        self.enter_stage(job_id, STEP_REMOVE_BACKGROUND, lease_lost).await?;
        let cutout = self.remover.remove_background(&recreated).await?;

        let target_dpi = self.normalizer.config().target_dpi;
        self.enter_stage(job_id, &step_normalize(target_dpi), lease_lost).await?;
        let normalizer = ImageNormalizer::new(self.normalizer.config());
        let normalized = tokio::task::spawn_blocking(move || normalizer.normalize(&cutout))
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))??;
        let transparent_location = self
            .put(&asset_key(job_id, "transparent", "png"), &normalized.bytes, "image/png")
            .await?;
        ensure_lease(job_id, lease_lost)?;
        let transparent = self
            .store
            .insert_asset(&NewAsset {
                kind: AssetKind::Transparent,
                owner_id: task.user_id.clone(),
                file_location: transparent_location.clone(),
                content_type: "image/png".to_string(),
                byte_size: normalized.bytes.len() as i64,
                width: Some(normalized.metadata.width),
                height: Some(normalized.metadata.height),
                dpi: Some(normalized.metadata.dpi),
                job_id,
            })
            .await?;

        self.enter_stage(job_id, STEP_VERIFY, lease_lost).await?;
        let stored = self.get(&transparent_location).await?;
        let metadata = read_metadata(&stored)?;
        self.normalizer.verify(&metadata)?;

        Ok(ExtractionResult {
            original_asset_id: task.upload_asset_id.clone(),
            recreated_asset_id,
            transparent_asset_id: transparent.id,
            transparent_location,
            metadata,
        })
    }

    /// Log a stage marker, unless the lease is gone.
    async fn enter_stage(
        &self,
        job_id: Uuid,
        marker: &str,
        lease_lost: &CancellationToken,
    ) -> Result<(), PipelineError> {
        ensure_lease(job_id, lease_lost)?;
        tracing::info!(job_id = %job_id, stage = marker, "Entering stage");
        self.store.append_log(job_id, marker).await?;
        Ok(())
    }

    /// Resolve a source reference: an http(s) URL, a local path, or an
    /// asset-storage key.
    async fn load_source(&self, source_ref: &str) -> Result<Vec<u8>, PipelineError> {
        if source_ref.starts_with("http://") || source_ref.starts_with("https://") {
            let response = self
                .http
                .get(source_ref)
                .timeout(self.call_timeout)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| PipelineError::Source(format!("{source_ref}: {e}")))?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| PipelineError::Source(format!("{source_ref}: {e}")))?;
            return Ok(bytes.to_vec());
        }

        let path = source_ref.strip_prefix("file://").unwrap_or(source_ref);
        if source_ref.starts_with("file://") || Path::new(path).is_absolute() {
            return tokio::fs::read(path)
                .await
                .map_err(|e| PipelineError::Source(format!("{path}: {e}")));
        }

        Ok(self.get(source_ref).await?)
    }

    async fn persist(
        &self,
        task: &ExtractionTask,
        kind: AssetKind,
        name: &str,
        bytes: &[u8],
        lease_lost: &CancellationToken,
    ) -> Result<Uuid, PipelineError> {
        let (extension, content_type) = image_format(bytes);
        let location = self
            .put(&asset_key(task.job_id, name, extension), bytes, content_type)
            .await?;
        ensure_lease(task.job_id, lease_lost)?;
        let dimensions = image_dimensions(bytes);
        let asset = self
            .store
            .insert_asset(&NewAsset {
                kind,
                owner_id: task.user_id.clone(),
                file_location: location,
                content_type: content_type.to_string(),
                byte_size: bytes.len() as i64,
                width: dimensions.map(|(w, _)| w),
                height: dimensions.map(|(_, h)| h),
                dpi: None,
                job_id: task.job_id,
            })
            .await?;
        Ok(asset.id)
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, CapabilityError> {
        guarded_call(&self.registry, Dependency::AssetStorage, self.call_timeout, || async {
            self.storage
                .put(key, bytes, content_type)
                .await
                .map_err(CapabilityError::from)
        })
        .await
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, CapabilityError> {
        guarded_call(&self.registry, Dependency::AssetStorage, self.call_timeout, || async {
            self.storage.get(location).await.map_err(CapabilityError::from)
        })
        .await
    }
}

fn ensure_lease(job_id: Uuid, lease_lost: &CancellationToken) -> Result<(), PipelineError> {
    if lease_lost.is_cancelled() {
        return Err(PipelineError::LeaseLost(job_id));
    }
    Ok(())
}

/// The terminal status a rejected write ran into, if another run already
/// finished the job.
fn finished_status(err: &StoreError) -> Option<JobStatus> {
    match err {
        StoreError::InvalidTransition { from, .. } if from.is_terminal() => Some(*from),
        _ => None,
    }
}

fn asset_key(job_id: Uuid, name: &str, extension: &str) -> String {
    format!("extractions/{job_id}/{name}.{extension}")
}

fn image_format(bytes: &[u8]) -> (&'static str, &'static str) {
    match image::guess_format(bytes) {
        Ok(format) => (
            format.extensions_str().first().copied().unwrap_or("bin"),
            format.to_mime_type(),
        ),
        Err(_) => ("png", "image/png"),
    }
}

fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to load source image: {0}")]
    Source(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Image processing task failed: {0}")]
    Worker(String),

    #[error("Lease lost for job {0}")]
    LeaseLost(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryJobStore;
    use crate::models::job::NewJob;
    use crate::services::background_removal::BackgroundRemover;
    use crate::services::generative::ImageGenerator;
    use crate::services::normalizer::NormalizerConfig;
    use crate::services::storage::{MemoryStorage, StorageError};
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([10, 120, 200, 255])))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    struct FixedGenerator(Result<Vec<u8>, CapabilityError>);

    #[async_trait]
    impl ImageGenerator for FixedGenerator {
        async fn recreate(&self, _image: &[u8], _mime: &str, _prompt: &str) -> Result<Vec<u8>, CapabilityError> {
            self.0.clone()
        }
    }

    struct PassThroughRemover;

    #[async_trait]
    impl BackgroundRemover for PassThroughRemover {
        async fn remove_background(&self, image: &[u8]) -> Result<Vec<u8>, CapabilityError> {
            Ok(image.to_vec())
        }
    }

    struct Fixture {
        store: Arc<MemoryJobStore>,
        storage: Arc<MemoryStorage>,
        pipeline: ExtractionPipeline,
    }

    /// Storage that cancels `lease_lost` when the final artifact is read back.
    struct LeaseLosingStorage {
        inner: Arc<MemoryStorage>,
        lease_lost: CancellationToken,
    }

    #[async_trait]
    impl AssetStorage for LeaseLosingStorage {
        async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError> {
            self.inner.put(key, data, content_type).await
        }

        async fn get(&self, location: &str) -> Result<Vec<u8>, StorageError> {
            if location.contains("transparent") {
                self.lease_lost.cancel();
            }
            self.inner.get(location).await
        }
    }

    /// Remover that lets another run fail every job of user `u1` first.
    struct RacingRemover(Arc<MemoryJobStore>);

    #[async_trait]
    impl BackgroundRemover for RacingRemover {
        async fn remove_background(&self, image: &[u8]) -> Result<Vec<u8>, CapabilityError> {
            for job in self.0.list_jobs_for_user("u1").await.unwrap() {
                self.0.mark_error(job.id, "failed by another worker").await.unwrap();
            }
            Ok(image.to_vec())
        }
    }

    fn fixture(generated: Result<Vec<u8>, CapabilityError>) -> Fixture {
        fixture_with(
            generated,
            |_| Arc::new(PassThroughRemover),
            |storage| storage as Arc<dyn AssetStorage>,
        )
    }

    fn fixture_with(
        generated: Result<Vec<u8>, CapabilityError>,
        remover: impl FnOnce(Arc<MemoryJobStore>) -> Arc<dyn BackgroundRemover>,
        wrap_storage: impl FnOnce(Arc<MemoryStorage>) -> Arc<dyn AssetStorage>,
    ) -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let storage = Arc::new(MemoryStorage::new());
        let registry = Arc::new(DependencyHealthRegistry::new());
        let timeout = Duration::from_secs(60);
        let pipeline = ExtractionPipeline::new(
            store.clone(),
            wrap_storage(storage.clone()),
            registry.clone(),
            GenerativeImageClient::new(Arc::new(FixedGenerator(generated)), registry.clone(), timeout, None),
            BackgroundRemovalClient::new(remover(store.clone()), registry.clone(), timeout),
            ImageNormalizer::new(NormalizerConfig {
                min_dimension: 64,
                target_dpi: 300,
            }),
            timeout,
        );
        Fixture {
            store,
            storage,
            pipeline,
        }
    }

    async fn queued_task(fixture: &Fixture) -> ExtractionTask {
        fixture.storage.put("uploads/photo.png", &png(8, 8), "image/png").await.unwrap();
        let job = fixture
            .store
            .insert_job(
                &NewJob {
                    upload_asset_id: "asset-1".into(),
                    user_id: Some("u1".into()),
                    source_file_ref: "uploads/photo.png".into(),
                },
                "Job created",
            )
            .await
            .unwrap();
        ExtractionTask {
            job_id: job.id,
            upload_asset_id: job.upload_asset_id,
            source_file_ref: job.source_file_ref,
            user_id: job.user_id,
        }
    }

    #[tokio::test]
    async fn test_successful_run_produces_print_ready_asset() {
        let fixture = fixture(Ok(png(32, 16)));
        let task = queued_task(&fixture).await;

        let outcome = fixture.pipeline.run(&task, &CancellationToken::new()).await.unwrap();
        let PipelineOutcome::Done(result) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(result.metadata.dpi, 300);
        assert_eq!((result.metadata.width, result.metadata.height), (128, 64));
        assert_eq!(result.original_asset_id, "asset-1");

        let job = fixture.store.get_job(task.job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Done);
        assert_eq!(
            job.logs,
            vec![
                "Job created",
                EXTRACTION_STARTED,
                STEP_RECREATE,
                STEP_REMOVE_BACKGROUND,
                "Step 3: normalizing to 300 DPI",
                STEP_VERIFY,
                EXTRACTION_COMPLETED,
            ]
        );

        let kinds: Vec<AssetKind> = fixture
            .store
            .list_assets(task.job_id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(kinds, vec![AssetKind::Recreated, AssetKind::Transparent]);
    }

    #[tokio::test]
    async fn test_failure_in_first_stage_stops_pipeline() {
        let fixture = fixture(Err(CapabilityError::AuthInvalid("Gemini API key invalid".into())));
        let task = queued_task(&fixture).await;

        let outcome = fixture.pipeline.run(&task, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Failed("AUTH_FAILED: Gemini API key invalid".into())
        );

        let job = fixture.store.get_job(task.job_id).await.unwrap().unwrap();
        assert_eq!(job.state.error_message(), Some("AUTH_FAILED: Gemini API key invalid"));
        assert!(job.completed_at.is_some());
        assert!(!job.logs.iter().any(|l| l.starts_with("Step 2")));
        assert!(fixture.store.list_assets(task.job_id).await.unwrap().is_empty());
        // only the uploaded source is in storage
        assert_eq!(fixture.storage.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_lease_leaves_job_untouched() {
        let fixture = fixture(Ok(png(8, 8)));
        let task = queued_task(&fixture).await;
        let lease_lost = CancellationToken::new();
        lease_lost.cancel();

        let outcome = fixture.pipeline.run(&task, &lease_lost).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::LeaseLost);
        let job = fixture.store.get_job(task.job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.logs.last().unwrap(), EXTRACTION_STARTED);
    }

    #[tokio::test]
    async fn test_lease_lost_during_verify_does_not_finish_job() {
        let lease_lost = CancellationToken::new();
        let token = lease_lost.clone();
        let fixture = fixture_with(
            Ok(png(8, 8)),
            |_| Arc::new(PassThroughRemover),
            move |inner| Arc::new(LeaseLosingStorage { inner, lease_lost: token }),
        );
        let task = queued_task(&fixture).await;

        let outcome = fixture.pipeline.run(&task, &lease_lost).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::LeaseLost);

        let job = fixture.store.get_job(task.job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.logs.last().unwrap(), STEP_VERIFY);
        assert!(job.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_job_finished_by_another_run_is_not_an_error() {
        let fixture = fixture_with(
            Ok(png(8, 8)),
            |store| Arc::new(RacingRemover(store)),
            |storage| storage as Arc<dyn AssetStorage>,
        );
        let task = queued_task(&fixture).await;

        let outcome = fixture.pipeline.run(&task, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::AlreadyFinished(JobStatus::Error));

        let job = fixture.store.get_job(task.job_id).await.unwrap().unwrap();
        assert_eq!(job.state.error_message(), Some("failed by another worker"));
        assert!(!job.logs.iter().any(|l| l.starts_with("Step 3")));
    }

    #[tokio::test]
    async fn test_redelivery_of_finished_job_is_skipped() {
        let fixture = fixture(Err(CapabilityError::Failed("boom".into())));
        let task = queued_task(&fixture).await;
        fixture.pipeline.run(&task, &CancellationToken::new()).await.unwrap();

        let outcome = fixture.pipeline.run(&task, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::AlreadyFinished(JobStatus::Error));
    }

    #[tokio::test]
    async fn test_missing_local_source_fails_job() {
        let fixture = fixture(Ok(png(8, 8)));
        let mut task = queued_task(&fixture).await;
        task.source_file_ref = "/definitely/not/here.jpg".into();

        let outcome = fixture.pipeline.run(&task, &CancellationToken::new()).await.unwrap();
        let PipelineOutcome::Failed(message) = outcome else {
            panic!("expected failure");
        };
        assert!(message.starts_with("Failed to load source image"));
    }
}
