//! Failure classification for task executions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an execution attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The task exceeded its deadline or SLA.
    Timeout,
    /// The agent reported a failure it expects to go away on retry.
    TransientAgent,
    /// The agent could not be reached at all.
    AgentUnreachable,
    /// The payload was rejected by the agent.
    PayloadValidation,
    /// No agent can run the task within its cost budget.
    BudgetUnsatisfiable,
}

impl FailureKind {
    /// Retryable failures re-enter the queue while attempts remain.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::TransientAgent)
    }

    /// Infrastructure failures are charged to the agent's breaker, not the task.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::AgentUnreachable)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::TransientAgent => "transient agent error",
            Self::AgentUnreachable => "agent unreachable",
            Self::PayloadValidation => "payload validation error",
            Self::BudgetUnsatisfiable => "cost budget unsatisfiable",
        };
        f.write_str(label)
    }
}

/// A classified failure with a human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientAgent, message)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::TransientAgent.is_retryable());
        assert!(!FailureKind::PayloadValidation.is_retryable());
        assert!(!FailureKind::BudgetUnsatisfiable.is_retryable());
        assert!(FailureKind::AgentUnreachable.is_infrastructure());
        assert!(!FailureKind::AgentUnreachable.is_retryable());
    }

    #[test]
    fn test_display_includes_kind() {
        let f = TaskFailure::timeout("exceeded 300s SLA");
        assert_eq!(f.to_string(), "timeout: exceeded 300s SLA");
    }
}
