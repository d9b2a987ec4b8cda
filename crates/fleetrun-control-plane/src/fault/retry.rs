//! Task-level retry decisions.

use fleetrun_core::{FailureKind, Task, TaskFailure};

use crate::config::FaultConfig;

/// What happens to a task after a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Put back as Ready without charging an attempt (the agent was at fault).
    Requeue,
    /// Charge the attempt and put back as Ready, preferring another agent.
    Retry,
    /// Charge the attempt and move the task to the dead-letter store.
    DeadLetter { reason: String },
}

impl FailureOutcome {
    /// Whether the attempt counts against the task's budget.
    pub fn charges_attempt(&self) -> bool {
        !matches!(self, Self::Requeue)
    }
}

/// Classifies failures into retry outcomes.
#[derive(Debug, Clone)]
pub struct FaultHandler {
    max_attempts: u32,
}

impl FaultHandler {
    pub fn new(config: &FaultConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
        }
    }

    /// Decide the outcome for `task` failing with `failure`.
    ///
    /// `task.attempt_count` is the count before this failure is charged.
    pub fn decide(&self, task: &Task, failure: &TaskFailure) -> FailureOutcome {
        if failure.kind.is_infrastructure() {
            return FailureOutcome::Requeue;
        }

        let attempts = task.attempt_count.saturating_add(1);
        if !failure.kind.is_retryable() {
            return FailureOutcome::DeadLetter {
                reason: format!("non-retryable failure: {failure}"),
            };
        }
        if attempts >= self.max_attempts {
            return FailureOutcome::DeadLetter {
                reason: format!("retries exhausted after {attempts} attempts: {failure}"),
            };
        }
        FailureOutcome::Retry
    }

    /// Whether the failure should count against the agent's circuit breaker.
    ///
    /// Malformed payloads and unaffordable budgets are the task's fault.
    pub fn counts_against_agent(kind: FailureKind) -> bool {
        !matches!(
            kind,
            FailureKind::PayloadValidation | FailureKind::BudgetUnsatisfiable
        )
    }
}
