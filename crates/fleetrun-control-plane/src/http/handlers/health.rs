//! Liveness and Prometheus exposition.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde_json::json;

use crate::metrics::collect_metrics;
use crate::state::AppState;

/// Liveness plus a coarse load summary.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let agents = state.orchestrator.agents().await.len();
    let queue_utilization = state.orchestrator.queue_utilization().await;
    Json(json!({
        "status": "ok",
        "agents": agents,
        "queue_utilization": queue_utilization,
    }))
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        collect_metrics(&state).await,
    )
}
