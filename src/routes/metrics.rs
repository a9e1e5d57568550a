use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint, served by both the API server and the worker.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the service records.
pub fn describe_metrics() {
    metrics::describe_counter!("extraction_jobs_total", "Total extraction jobs submitted");
    metrics::describe_counter!("extraction_jobs_completed", "Total extraction jobs completed");
    metrics::describe_counter!("extraction_jobs_failed", "Total extraction jobs that failed");
    metrics::describe_histogram!(
        "extraction_processing_seconds",
        "Time to run the extraction pipeline for one job"
    );
    metrics::describe_gauge!(
        "extraction_queue_depth",
        "Current number of jobs waiting in the queue"
    );
    metrics::describe_gauge!(
        "dependency_circuit_state",
        "Circuit breaker state per dependency (0 closed, 1 half-open, 2 open)"
    );
    metrics::describe_counter!(
        "dependency_calls_rejected",
        "Calls refused without reaching the dependency"
    );
}
