use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use viz_worker_engine::{MetricsHandle, ReadinessState};

#[derive(Clone)]
struct AppState {
    readiness: Arc<ReadinessState>,
    metrics: MetricsHandle,
}

/// `/health/live` is always 200 once the process is up; `/health/ready` flips to 200 only
/// after the worker loop has finished startup; `/metrics` reports the in-process snapshot (§4.I).
pub fn router(readiness: Arc<ReadinessState>, metrics: MetricsHandle) -> Router {
    Router::new()
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/metrics", get(metrics_text))
        .with_state(AppState { readiness, metrics })
}

async fn live() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<AppState>) -> StatusCode {
    if state.readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_text(State(state): State<AppState>) -> String {
    state.metrics.snapshot_text()
}
