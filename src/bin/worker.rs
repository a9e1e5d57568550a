use artwork_extract::{
    app_state::AdminState,
    config::{AppConfig, BackgroundRemovalProvider},
    db::{self, PgJobStore},
    routes,
    services::{
        background_removal::{
            BackgroundRemovalClient, BackgroundRemover, FallbackRemover, RembgRemover,
            RemoveBgRemover,
        },
        generative::{GeminiImageGenerator, GenerativeImageClient},
        health_registry::DependencyHealthRegistry,
        normalizer::{ImageNormalizer, NormalizerConfig},
        pipeline::ExtractionPipeline,
        queue::{LeaseConfig, RedisWorkQueue},
        storage::R2Client,
        worker_pool::{WorkerPool, WorkerPoolConfig},
    },
};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting artwork extraction worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Metrics recorder for the admin surface
    let prometheus_handle = Arc::new(
        PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus metrics recorder"),
    );
    routes::metrics::describe_metrics();

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let storage = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");

    let queue = Arc::new(
        RedisWorkQueue::new(
            &config.redis_url,
            &config.queue_name,
            LeaseConfig {
                lock_duration: config.lock_duration(),
                max_stalled_count: config.max_stalled_count,
            },
        )
        .expect("Failed to initialize work queue"),
    );

    // Breakers and exhaustion flags shared by every job in this process
    let registry = Arc::new(DependencyHealthRegistry::new());
    let timeout = config.external_call_timeout();

    let generator = GenerativeImageClient::new(
        Arc::new(GeminiImageGenerator::new(
            config.gemini_api_key.clone(),
            config.gemini_model.clone(),
        )),
        registry.clone(),
        timeout,
        config.extraction_prompt.clone(),
    );

    // Background removal: rembg, with Remove.bg behind it when a key is set
    let rembg: Arc<dyn BackgroundRemover> =
        Arc::new(RembgRemover::new(config.rembg_endpoint.clone()));
    let remove_bg: Option<Arc<dyn BackgroundRemover>> = config
        .removebg_key()
        .map(|key| Arc::new(RemoveBgRemover::new(key.to_string())) as Arc<dyn BackgroundRemover>);
    let remover: Arc<dyn BackgroundRemover> = match (config.background_removal_provider, remove_bg) {
        (BackgroundRemovalProvider::Rembg, Some(remove_bg)) => {
            tracing::info!("Background removal: rembg with Remove.bg fallback");
            Arc::new(FallbackRemover::new(rembg, remove_bg))
        }
        (BackgroundRemovalProvider::Rembg, None) => {
            tracing::info!("Background removal: rembg only");
            rembg
        }
        (BackgroundRemovalProvider::RemoveBg, remove_bg) => {
            tracing::info!("Background removal: Remove.bg only");
            remove_bg.expect("REMOVEBG_API_KEY is required for remove_bg")
        }
    };

    let pipeline = ExtractionPipeline::new(
        Arc::new(PgJobStore::new(db_pool)),
        Arc::new(storage),
        registry.clone(),
        generator,
        BackgroundRemovalClient::new(remover, registry.clone(), timeout),
        ImageNormalizer::new(NormalizerConfig {
            min_dimension: config.min_output_px,
            target_dpi: config.target_dpi,
        }),
        timeout,
    );

    let pool = Arc::new(WorkerPool::new(
        queue,
        Arc::new(pipeline),
        WorkerPoolConfig {
            concurrency: config.worker_concurrency,
            poll_interval: config.poll_interval(),
            lock_duration: config.lock_duration(),
            stalled_interval: config.stalled_interval(),
            max_stalled_count: config.max_stalled_count,
        },
    ));

    let shutdown = CancellationToken::new();

    // Admin surface: dependency health, resets and metrics
    let admin = routes::admin_router(AdminState { registry })
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&config.worker_admin_addr)
        .await
        .expect("Failed to bind admin address");
    tracing::info!("Admin surface listening on {}", config.worker_admin_addr);

    let admin_shutdown = shutdown.clone();
    let admin_server = tokio::spawn(async move {
        axum::serve(listener, admin)
            .with_graceful_shutdown(admin_shutdown.cancelled_owned())
            .await
    });

    // Ctrl-C stops dequeuing; in-flight jobs finish first
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, finishing in-flight jobs");
        }
        signal_shutdown.cancel();
    });

    // Main processing loop
    tracing::info!("Worker ready, starting job processing loop");
    pool.run(shutdown).await;

    match admin_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Admin server error"),
        Err(e) => tracing::error!(error = %e, "Admin server task failed"),
    }
    tracing::info!("Worker shut down");
}
