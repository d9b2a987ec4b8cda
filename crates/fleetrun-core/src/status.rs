//! Status enums for Tasks and agent circuit breakers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task in the orchestrator.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for at least one dependency to complete.
    #[default]
    Pending,
    /// All dependencies completed; queued for dispatch.
    Ready,
    /// Claimed by the dispatcher for a specific agent.
    Assigned,
    /// Executing on the owning agent.
    Running,
    /// Completed successfully.
    Completed,
    /// Last attempt failed; awaiting retry or dead-lettering.
    Failed,
    /// Retries exhausted or failure was non-retryable.
    DeadLettered,
    /// Cancelled by a caller or by an unresolvable dependency.
    Cancelled,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 8] = [
        Self::Pending,
        Self::Ready,
        Self::Assigned,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::DeadLettered,
        Self::Cancelled,
    ];

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered | Self::Cancelled)
    }

    /// Returns true if an agent currently holds a claim on the task.
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// Returns true if dependents of a task in this status can never become Ready.
    ///
    /// `Failed` counts as unresolvable only once it is final; a retry moves the
    /// task back to `Ready`, so callers pass the final status here.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::DeadLettered | Self::Cancelled)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Cancelled)
                | (Ready, Assigned)
                | (Ready, Cancelled)
                | (Assigned, Running)
                | (Assigned, Ready)
                | (Assigned, Failed)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Ready)
                | (Running, Cancelled)
                | (Failed, Ready)
                | (Failed, DeadLettered)
        )
    }

    /// Lowercase label used in metrics and query strings.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a label produced by [`TaskStatus::as_label`] (case-insensitive).
    pub fn from_label(label: &str) -> Option<Self> {
        let lower = label.to_ascii_lowercase();
        Self::ALL.into_iter().find(|s| s.as_label() == lower)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// State of an agent's circuit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Dispatch allowed.
    #[default]
    Closed,
    /// Dispatch disallowed until the cooldown elapses.
    Open,
    /// A single probe dispatch is allowed.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}
