//! Agent registry handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use fleetrun_core::{Agent, AgentId, AgentSpec, DeregisterResponse};

use crate::http::responses::{ApiError, DeregisterQuery};
use crate::state::AppState;

pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<Agent>> {
    Json(state.orchestrator.agents().await)
}

pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<AgentSpec>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    let agent = state.orchestrator.register_agent(spec).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.orchestrator.agent(&AgentId::new(id)).await?))
}

/// Remove an agent; `?reason=unhealthy|shutdown|completed_elsewhere`.
pub async fn deregister_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DeregisterQuery>,
) -> Result<Json<DeregisterResponse>, ApiError> {
    let agent_id = AgentId::new(id);
    let requeued = state
        .orchestrator
        .deregister_agent(&agent_id, query.reason)
        .await?;
    Ok(Json(DeregisterResponse { agent_id, requeued }))
}

pub async fn agent_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.orchestrator.heartbeat(&AgentId::new(id)).await?))
}
