use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::store::StateCounts;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub model: ComponentHealth,
    pub queue: StateCounts,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
}

/// GET /healthz: 200 once the editor finished warm-up, 503 before.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let ready = state.inference.is_ready();
    let counts = state.store.counts();
    metrics::gauge!("edit_queue_depth").set(counts.queued as f64);

    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if ready { "ok" } else { "starting" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            model: ComponentHealth {
                status: if ready { "ready" } else { "loading" }.to_string(),
            },
            queue: counts,
        },
    };

    (status_code, Json(response))
}
