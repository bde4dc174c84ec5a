use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for the queue metrics.
pub fn describe() {
    metrics::describe_counter!("edit_jobs_total", "Edit jobs accepted, by source");
    metrics::describe_counter!("edit_jobs_completed", "Edit jobs that produced an artifact");
    metrics::describe_counter!("edit_jobs_failed", "Edit jobs that failed, by error kind");
    metrics::describe_counter!("edit_job_retries_total", "Transient failures that were retried");
    metrics::describe_histogram!(
        "edit_processing_seconds",
        "Wall time from claim to terminal state"
    );
    metrics::describe_gauge!("edit_queue_depth", "Jobs waiting for a slot");
    metrics::describe_counter!("inbox_rows_malformed_total", "Ledger rows rejected as malformed");
}

/// Prometheus metrics scrape endpoint.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
