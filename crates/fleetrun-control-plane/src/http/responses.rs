//! HTTP request parameters, response types and error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::debug;

use fleetrun_core::{CoreError, ErrorResponse};

use crate::registry::DeregisterReason;

/// Default page size for list endpoints.
pub const DEFAULT_LIMIT: usize = 100;

// ============================================================================
// Query parameters
// ============================================================================

/// Query for `GET /v1/tasks`.
#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    /// Status label, e.g. `ready` or `dead_lettered`.
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// Query for `DELETE /v1/agents/:id`.
#[derive(Debug, Default, Deserialize)]
pub struct DeregisterQuery {
    #[serde(default)]
    pub reason: DeregisterReason,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

// ============================================================================
// Error types
// ============================================================================

/// An error rendered as `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::TaskNotFound(_)
            | CoreError::AgentNotFound(_)
            | CoreError::DeadLetterNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::DuplicateTask(_)
            | CoreError::DuplicateAgent(_)
            | CoreError::StalePrecondition { .. }
            | CoreError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            CoreError::UnknownDependency { .. }
            | CoreError::CyclicDependency(_)
            | CoreError::InvalidInput(_)
            | CoreError::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::QueueSaturated { .. } => StatusCode::TOO_MANY_REQUESTS,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!(status = %self.status, error = %self.message, "Request rejected");
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}
