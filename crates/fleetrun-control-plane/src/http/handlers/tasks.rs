//! Task handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use fleetrun_core::{
    CompletionReport, CoreError, FailureReport, SubmitRequest, SubmitResponse, Task, TaskId,
    TaskStatus,
};

use crate::graph::CriticalPath;
use crate::http::responses::{ApiError, ListTasksQuery, DEFAULT_LIMIT};
use crate::state::AppState;

/// Submit a batch of tasks.
pub async fn submit_tasks(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let tasks = state.orchestrator.submit(req.tasks).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { tasks })))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|label| {
            TaskStatus::from_label(label)
                .ok_or_else(|| CoreError::InvalidInput(format!("unknown status '{label}'")))
        })
        .transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    Ok(Json(state.orchestrator.list_tasks(status, limit).await))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.orchestrator.task(&TaskId::new(id)).await?))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.orchestrator.cancel(&TaskId::new(id)).await?))
}

/// Completion report from an agent that runs tasks on its own.
pub async fn complete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(report): Json<CompletionReport>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(
        state.orchestrator.complete(&TaskId::new(id), report).await?,
    ))
}

pub async fn fail_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(report): Json<FailureReport>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.orchestrator.fail(&TaskId::new(id), report).await?))
}

pub async fn critical_path(State(state): State<Arc<AppState>>) -> Json<CriticalPath> {
    Json(state.orchestrator.critical_path().await)
}
