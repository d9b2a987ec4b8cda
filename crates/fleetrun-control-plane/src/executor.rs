//! Agent execution contract and its HTTP adapter.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleetrun_core::{FailureKind, Priority, Task, TaskFailure, TaskId};

/// Errors an agent can return for one execution.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("execution timed out")]
    Timeout,

    #[error("transient agent error: {0}")]
    Transient(String),

    #[error("agent unreachable: {0}")]
    Unreachable(String),

    #[error("payload rejected: {0}")]
    InvalidPayload(String),

    #[error("budget cannot be met: {0}")]
    BudgetUnsatisfiable(String),

    /// The agent stopped because the task's cancellation token fired.
    #[error("execution cancelled")]
    Cancelled,
}

impl AgentError {
    /// Failure classification, or `None` for an acknowledged cancellation.
    pub fn into_failure(self) -> Option<TaskFailure> {
        let message = self.to_string();
        let kind = match self {
            Self::Timeout => FailureKind::Timeout,
            Self::Transient(_) => FailureKind::TransientAgent,
            Self::Unreachable(_) => FailureKind::AgentUnreachable,
            Self::InvalidPayload(_) => FailureKind::PayloadValidation,
            Self::BudgetUnsatisfiable(_) => FailureKind::BudgetUnsatisfiable,
            Self::Cancelled => return None,
        };
        Some(TaskFailure::new(kind, message))
    }
}

/// Something that can run tasks on behalf of a registered agent.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run the task to completion. Implementations should stop promptly and
    /// return [`AgentError::Cancelled`] once `cancel` fires.
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<Value, AgentError>;

    /// Liveness probe.
    async fn heartbeat(&self) -> bool;
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    task_id: &'a TaskId,
    #[serde(rename = "type")]
    task_type: &'a str,
    payload: &'a Value,
    priority: Priority,
    attempt: u32,
}

/// Executor for agents exposing `POST /execute` and `GET /health`.
pub struct HttpAgentExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAgentExecutor {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    async fn post_execute(&self, task: &Task) -> Result<Value, AgentError> {
        let url = format!("{}/execute", self.endpoint);
        debug!(url = %url, task_id = %task.id, "Dispatching task to agent");

        let body = ExecuteRequest {
            task_id: &task.id,
            task_type: &task.task_type,
            payload: &task.payload,
            priority: task.priority,
            attempt: task.attempt_count + 1,
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| AgentError::Transient(format!("invalid response body: {e}")));
        }

        let text = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            400 | 422 => AgentError::InvalidPayload(text),
            402 => AgentError::BudgetUnsatisfiable(text),
            408 | 504 => AgentError::Timeout,
            _ => AgentError::Transient(format!("HTTP {status}: {text}")),
        })
    }
}

fn classify_transport(err: reqwest::Error) -> AgentError {
    if err.is_timeout() {
        AgentError::Timeout
    } else if err.is_connect() {
        AgentError::Unreachable(err.to_string())
    } else {
        AgentError::Transient(err.to_string())
    }
}

#[async_trait]
impl AgentExecutor for HttpAgentExecutor {
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<Value, AgentError> {
        tokio::select! {
            result = self.post_execute(task) => result,
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
        }
    }

    async fn heartbeat(&self) -> bool {
        let url = format!("{}/health", self.endpoint);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "Agent health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let kind = |e: AgentError| e.into_failure().map(|f| f.kind);
        assert_eq!(kind(AgentError::Timeout), Some(FailureKind::Timeout));
        assert_eq!(
            kind(AgentError::Unreachable("refused".into())),
            Some(FailureKind::AgentUnreachable)
        );
        assert_eq!(
            kind(AgentError::InvalidPayload("bad".into())),
            Some(FailureKind::PayloadValidation)
        );
        assert_eq!(kind(AgentError::Cancelled), None);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_heartbeat() {
        let executor = HttpAgentExecutor::new("http://127.0.0.1:1/");
        assert!(!executor.heartbeat().await);
    }
}
