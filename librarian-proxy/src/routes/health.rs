//! Health check and metrics endpoints.

use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;

use crate::metrics::prometheus::encode_metrics;
use crate::state::AppState;

/// Health check endpoint
///
/// GET /health
///
/// Answers without touching the runtime, the admission queue or the
/// security perimeter.
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "librarian"
    }))
}

/// Admission configuration, live load and cumulative counters
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.admission.metrics().snapshot();
    let load = state.admission.load_stats();

    Json(json!({
        "admission": {
            "config": state.admission.config(),
            "current": load,
            "totals": snapshot
        },
        "retry": state.orchestrator.config(),
        "session_locks": state.orchestrator.leases().locks().len()
    }))
}

/// Prometheus text exposition
///
/// GET /metrics/prometheus
pub async fn metrics_prometheus() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        encode_metrics(),
    )
}
