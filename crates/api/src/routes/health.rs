//! Health and metrics endpoints.

use axum::{extract::State, http::StatusCode, Json};
use telemetry::{health, metrics, MetricsSnapshot};

use crate::response::HealthResponse;
use crate::state::AppState;

/// GET /health - Full health check.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = health().report();
    let watermark = metrics().combined_watermark_ms.get();

    Json(HealthResponse {
        status: format!("{:?}", report.status).to_lowercase(),
        pipeline: state.pipeline_name.to_string(),
        epoch: state.epoch.to_string(),
        uptime_secs: state.uptime_secs(),
        components: report.components,
        pending_facts: metrics().pending_facts.get(),
        queue_depth: metrics().queue_depth.get(),
        combined_watermark_ms: (watermark > 0).then_some(watermark),
    })
}

/// GET /health/ready - Readiness check (pipeline running, sink reachable).
pub async fn ready_handler() -> StatusCode {
    if health().is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health/live - Liveness check (service is running).
pub async fn live_handler() -> StatusCode {
    if health().is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /metrics - Snapshot of internal counters, gauges and histograms.
pub async fn metrics_handler() -> Json<MetricsSnapshot> {
    Json(metrics().snapshot())
}
