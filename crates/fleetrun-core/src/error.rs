//! Core domain errors.

use thiserror::Error;

use crate::{AgentId, DeadLetterId, TaskId, TaskStatus};

/// Core domain errors for FleetRun.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Agent not found.
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// Dead-letter entry not found.
    #[error("Dead-letter entry not found: {0}")]
    DeadLetterNotFound(DeadLetterId),

    /// A task with this id already exists (or appears twice in a batch).
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// An agent with this id is already registered.
    #[error("Duplicate agent id: {0}")]
    DuplicateAgent(AgentId),

    /// A dependency is neither stored nor part of the same batch.
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    /// The batch contains a dependency cycle.
    #[error("Cyclic dependency: {}", format_cycle(.0))]
    CyclicDependency(Vec<TaskId>),

    /// Load shedding: the queue is at or above its shedding threshold.
    #[error("Queue saturated: {queued}/{capacity} queued")]
    QueueSaturated { queued: usize, capacity: usize },

    /// A conditional write lost against a concurrent writer.
    #[error("Stale precondition on task '{task}': expected {expected}, found {actual}")]
    StalePrecondition {
        task: TaskId,
        expected: String,
        actual: String,
    },

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Validation errors are rejected at submission and never reach the queue.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateTask(_)
                | Self::UnknownDependency { .. }
                | Self::CyclicDependency(_)
                | Self::InvalidInput(_)
        )
    }
}

fn format_cycle(ids: &[TaskId]) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
