//! Shared fixtures for the in-memory pipeline scenarios.
#![allow(dead_code)]

use artwork_extract::{
    db::MemoryJobStore,
    services::{
        background_removal::{BackgroundRemovalClient, BackgroundRemover},
        capability::CapabilityError,
        generative::{GenerativeImageClient, ImageGenerator},
        health_registry::DependencyHealthRegistry,
        job_service::JobService,
        normalizer::{ImageNormalizer, NormalizerConfig},
        pipeline::ExtractionPipeline,
        queue::{LeaseConfig, MemoryWorkQueue},
        retry::Backoff,
        storage::{AssetStorage, MemoryStorage},
        worker_pool::{WorkerPool, WorkerPoolConfig},
    },
};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const LOCK_DURATION: Duration = Duration::from_secs(30);
pub const MAX_STALLED: u32 = 2;
pub const MIN_OUTPUT_PX: u32 = 64;
pub const TARGET_DPI: u32 = 300;

pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([240, 200, 20, 255]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Generative capability that replays a configurable response.
pub struct FakeGenerator {
    calls: AtomicUsize,
    response: Mutex<Result<Vec<u8>, CapabilityError>>,
}

impl FakeGenerator {
    pub fn respond_with(&self, response: Result<Vec<u8>, CapabilityError>) {
        *self.response.lock() = response;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageGenerator for FakeGenerator {
    async fn recreate(&self, _image: &[u8], _mime: &str, _prompt: &str) -> Result<Vec<u8>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.lock().clone()
    }
}

/// Background remover that echoes its input unless told to fail.
#[derive(Default)]
pub struct FakeRemover {
    calls: AtomicUsize,
    failure: Mutex<Option<CapabilityError>>,
}

impl FakeRemover {
    pub fn fail_with(&self, failure: Option<CapabilityError>) {
        *self.failure.lock() = failure;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundRemover for FakeRemover {
    async fn remove_background(&self, image: &[u8]) -> Result<Vec<u8>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failure.lock().clone() {
            Some(failure) => Err(failure),
            None => Ok(image.to_vec()),
        }
    }
}

/// Job service, worker pool and fakes wired over in-memory backends.
pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryWorkQueue>,
    pub storage: Arc<MemoryStorage>,
    pub registry: Arc<DependencyHealthRegistry>,
    pub generator: Arc<FakeGenerator>,
    pub remover: Arc<FakeRemover>,
    pub service: Arc<JobService>,
    pub pool: Arc<WorkerPool>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryWorkQueue::new(LeaseConfig {
            lock_duration: LOCK_DURATION,
            max_stalled_count: MAX_STALLED,
        }));
        let storage = Arc::new(MemoryStorage::new());
        let registry = Arc::new(DependencyHealthRegistry::new());
        let generator = Arc::new(FakeGenerator {
            calls: AtomicUsize::new(0),
            response: Mutex::new(Ok(sample_png(24, 16))),
        });
        let remover = Arc::new(FakeRemover::default());
        let timeout = Duration::from_secs(60);

        let pipeline = ExtractionPipeline::new(
            store.clone(),
            storage.clone(),
            registry.clone(),
            GenerativeImageClient::new(generator.clone(), registry.clone(), timeout, None),
            BackgroundRemovalClient::new(remover.clone(), registry.clone(), timeout),
            ImageNormalizer::new(NormalizerConfig {
                min_dimension: MIN_OUTPUT_PX,
                target_dpi: TARGET_DPI,
            }),
            timeout,
        );

        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(pipeline),
            WorkerPoolConfig {
                concurrency: 2,
                poll_interval: Duration::from_millis(10),
                lock_duration: LOCK_DURATION,
                stalled_interval: Duration::from_secs(30),
                max_stalled_count: MAX_STALLED,
            },
        ));

        let service = Arc::new(JobService::new(
            store.clone(),
            queue.clone(),
            Backoff::new(3, Duration::from_millis(5)),
        ));

        Self {
            store,
            queue,
            storage,
            registry,
            generator,
            remover,
            service,
            pool,
        }
    }

    /// Put a photo into asset storage and return its key.
    pub async fn upload(&self, key: &str) -> String {
        self.storage
            .put(key, &sample_png(12, 12), "image/png")
            .await
            .unwrap()
    }
}
