use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod csv;
pub mod health;
pub mod jobs;
pub mod metrics;

/// Build the orchestrator's HTTP surface.
pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/healthz", get(health::health_check))
        .route("/api/edit", post(jobs::submit_edit))
        .route(
            "/api/jobs/{job_id}",
            get(jobs::get_job_status).delete(jobs::cancel_job),
        )
        .route("/csv", get(csv::get_csv))
        .route("/csv/append", post(csv::append_csv))
        .route("/csv/ingest", post(csv::ingest_csv))
        .route("/csv/ui", get(csv::csv_ui))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
}
