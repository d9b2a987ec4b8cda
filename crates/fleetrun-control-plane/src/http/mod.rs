//! HTTP server for the control plane.
//!
//! Provides endpoints for:
//! - Task submission, queries, cancellation and agent reports (`/v1/tasks`)
//! - Agent registry (`/v1/agents`)
//! - Dead-letter inspection and reprocessing (`/v1/dead-letters`)
//! - Autoscaling exports (`/v1/features`, `/v1/forecast`, `/v1/scaling`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Tasks
        .route(
            "/v1/tasks",
            get(handlers::list_tasks).post(handlers::submit_tasks),
        )
        .route("/v1/tasks/:id", get(handlers::get_task))
        .route("/v1/tasks/:id/cancel", post(handlers::cancel_task))
        .route("/v1/tasks/:id/complete", post(handlers::complete_task))
        .route("/v1/tasks/:id/fail", post(handlers::fail_task))
        .route("/v1/critical-path", get(handlers::critical_path))
        // Agents
        .route(
            "/v1/agents",
            get(handlers::list_agents).post(handlers::register_agent),
        )
        .route(
            "/v1/agents/:id",
            get(handlers::get_agent).delete(handlers::deregister_agent),
        )
        .route("/v1/agents/:id/heartbeat", post(handlers::agent_heartbeat))
        // Dead letters
        .route("/v1/dead-letters", get(handlers::list_dead_letters))
        .route("/v1/dead-letters/:id", get(handlers::get_dead_letter))
        .route(
            "/v1/dead-letters/:id/reprocess",
            post(handlers::reprocess_dead_letter),
        )
        // Autoscaling
        .route("/v1/features", get(handlers::features))
        .route("/v1/forecast", get(handlers::forecast))
        .route("/v1/scaling/decisions", get(handlers::scaling_decisions))
        .route("/v1/scaling/manual", post(handlers::manual_scaling))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(cors)
        .with_state(state)
}
