//! Autoscaling export handlers.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};

use fleetrun_core::{CoreError, ManualScalingRequest, ScalingDecision};

use crate::autoscale::{FeatureVector, Forecast};
use crate::http::responses::{ApiError, LimitQuery};
use crate::state::AppState;

/// Recent feature vectors, oldest first.
pub async fn features(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<FeatureVector>> {
    Json(state.autoscaler.feature_history(query.limit()).await)
}

/// Latest forecast, computed on demand if none exists yet.
pub async fn forecast(State(state): State<Arc<AppState>>) -> Json<Forecast> {
    let forecast = match state.autoscaler.latest_forecast().await {
        Some(forecast) => forecast,
        None => state.autoscaler.forecast(state.orchestrator.now()).await,
    };
    Json(forecast)
}

/// Recent scaling decisions, newest last.
pub async fn scaling_decisions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<ScalingDecision>> {
    Json(state.autoscaler.decisions(query.limit()).await)
}

pub async fn manual_scaling(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ManualScalingRequest>,
) -> Result<(StatusCode, Json<ScalingDecision>), ApiError> {
    if req.agent_type.trim().is_empty() {
        return Err(CoreError::InvalidInput("agent_type must not be empty".into()).into());
    }
    let current = state
        .orchestrator
        .pool_stats()
        .await
        .get(&req.agent_type)
        .map_or(0, |stats| stats.agents);
    let decision = state
        .autoscaler
        .manual(&req.agent_type, current, req.target, state.orchestrator.now())
        .await;
    Ok((StatusCode::CREATED, Json(decision)))
}
