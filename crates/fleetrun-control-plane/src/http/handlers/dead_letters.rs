//! Dead-letter handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use fleetrun_core::{DeadLetterEntry, DeadLetterId, Task};

use crate::http::responses::ApiError;
use crate::state::AppState;

pub async fn list_dead_letters(State(state): State<Arc<AppState>>) -> Json<Vec<DeadLetterEntry>> {
    Json(state.orchestrator.dead_letters().await)
}

pub async fn get_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeadLetterEntry>, ApiError> {
    Ok(Json(
        state
            .orchestrator
            .dead_letter(&DeadLetterId::new(id))
            .await?,
    ))
}

/// Resubmit the entry as a new task. The entry itself is kept.
pub async fn reprocess_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state
        .orchestrator
        .reprocess(&DeadLetterId::new(id))
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}
