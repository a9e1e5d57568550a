use artwork_extract::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgJobStore},
    routes,
    services::{
        job_service::JobService,
        queue::{LeaseConfig, RedisWorkQueue},
        retry::Backoff,
    },
};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
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

    // Environment and .env configuration
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing artwork-extract API server");

    // Prometheus recorder plus metric descriptions
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    // Job store
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Work queue shared with the workers
    tracing::info!(queue = %config.queue_name, "Connecting to Redis work queue");
    let queue = RedisWorkQueue::new(
        &config.redis_url,
        &config.queue_name,
        LeaseConfig {
            lock_duration: config.lock_duration(),
            max_stalled_count: config.max_stalled_count,
        },
    )
    .expect("Failed to initialize work queue");

    // Job creation retries enqueue failures with exponential backoff
    let jobs = JobService::new(
        Arc::new(PgJobStore::new(db_pool)),
        Arc::new(queue),
        Backoff::new(config.enqueue_attempts, config.enqueue_backoff()),
    );
    let state = AppState::new(jobs);

    let app = routes::api_router(state)
        // /metrics renders from the recorder handle, not AppState
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
