//! Task types: submission descriptors, stored tasks and attempt history.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AgentId, CoreError, DeadLetterId, Priority, TaskId, TaskStatus};

fn default_complexity() -> f64 {
    1.0
}

/// A task descriptor as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-chosen id; generated when absent. Required to be referenced as a
    /// dependency by other tasks of the same batch.
    #[serde(default)]
    pub id: Option<TaskId>,

    /// Capability tag used to match agents.
    #[serde(rename = "type")]
    pub task_type: String,

    /// Opaque payload forwarded to the agent.
    #[serde(default)]
    pub payload: Value,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,

    #[serde(default = "default_complexity")]
    pub estimated_complexity: f64,

    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,

    #[serde(default)]
    pub cost_budget: Option<f64>,
}

impl TaskSpec {
    /// Create a descriptor for the given task type with default settings.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            payload: Value::Null,
            priority: Priority::Normal,
            dependencies: BTreeSet::new(),
            estimated_complexity: default_complexity(),
            deadline: None,
            cost_budget: None,
        }
    }

    /// Builder method to set a specific ID.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to add a dependency.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.estimated_complexity = complexity;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cost_budget(mut self, budget: f64) -> Self {
        self.cost_budget = Some(budget);
        self
    }

    /// Field-level validation, independent of other tasks.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.task_type.trim().is_empty() {
            return Err(CoreError::InvalidInput("task type is required".into()));
        }
        if !self.estimated_complexity.is_finite() || self.estimated_complexity <= 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "estimated_complexity must be positive, got {}",
                self.estimated_complexity
            )));
        }
        if let Some(budget) = self.cost_budget {
            if !budget.is_finite() || budget < 0.0 {
                return Err(CoreError::InvalidInput(format!(
                    "cost_budget must be non-negative, got {budget}"
                )));
            }
        }
        if let Some(id) = &self.id {
            if id.as_str().is_empty() {
                return Err(CoreError::InvalidInput("task id must not be empty".into()));
            }
            if self.dependencies.contains(id) {
                return Err(CoreError::CyclicDependency(vec![id.clone(), id.clone()]));
            }
        }
        Ok(())
    }

    /// Materialize the descriptor into a Pending task.
    pub fn into_task(self, created_at: DateTime<Utc>) -> Task {
        Task {
            id: self.id.unwrap_or_else(TaskId::generate),
            task_type: self.task_type,
            payload: self.payload,
            priority: self.priority,
            dependencies: self.dependencies,
            estimated_complexity: self.estimated_complexity,
            deadline: self.deadline,
            cost_budget: self.cost_budget,
            status: TaskStatus::Pending,
            attempt_count: 0,
            assigned_agent_id: None,
            created_at,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            attempt_history: Vec::new(),
            derived_from: None,
            version: 0,
            claim_version: None,
        }
    }
}

/// One failed execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub agent_id: AgentId,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// A Task as held by the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Capability tag used to match agents.
    #[serde(rename = "type")]
    pub task_type: String,

    /// Opaque payload; never inspected by the orchestrator.
    pub payload: Value,

    pub priority: Priority,

    /// Tasks that must complete before this one becomes Ready.
    pub dependencies: BTreeSet<TaskId>,

    pub estimated_complexity: f64,

    pub deadline: Option<DateTime<Utc>>,

    pub cost_budget: Option<f64>,

    /// Current task status.
    pub status: TaskStatus,

    /// Number of failed attempts charged to this task.
    pub attempt_count: u32,

    /// Agent holding the claim while Assigned/Running.
    pub assigned_agent_id: Option<AgentId>,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Agent result when Completed.
    pub result: Option<Value>,

    /// Most recent failure or cancellation reason.
    pub error: Option<String>,

    pub attempt_history: Vec<AttemptRecord>,

    /// Dead-letter entry this task was reprocessed from.
    pub derived_from: Option<DeadLetterId>,

    /// Store sequence of the last write; used for conditional writes.
    pub version: u64,

    /// Store sequence of the claim that assigned the current agent. Reports
    /// carrying an older claim are rejected.
    pub claim_version: Option<u64>,
}

impl Task {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, enforcing the lifecycle.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Append a failed attempt to the history.
    pub fn record_attempt(&mut self, agent_id: AgentId, error: impl Into<String>, at: DateTime<Utc>) {
        self.attempt_history.push(AttemptRecord {
            agent_id,
            error: error.into(),
            timestamp: at,
        });
    }

    /// Agents that already failed this task, most recent last.
    pub fn failed_agents(&self) -> impl Iterator<Item = &AgentId> {
        self.attempt_history.iter().map(|a| &a.agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: TaskSpec = serde_json::from_value(json!({ "type": "codegen" })).unwrap();
        assert_eq!(spec.task_type, "codegen");
        assert_eq!(spec.priority, Priority::Normal);
        assert_eq!(spec.estimated_complexity, 1.0);
        assert!(spec.dependencies.is_empty());
    }

    #[test]
    fn test_validate_rejects_non_positive_complexity() {
        let spec = TaskSpec::new("codegen").with_complexity(0.0);
        assert!(matches!(spec.validate(), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let spec = TaskSpec::new("codegen").with_id("a").depends_on("a");
        assert!(matches!(
            spec.validate(),
            Err(CoreError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_into_task_generates_id() {
        let task = TaskSpec::new("test").into_task(Utc::now());
        assert!(!task.id.as_str().is_empty());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
    }

    #[test]
    fn test_transition_is_checked() {
        let mut task = TaskSpec::new("test").into_task(Utc::now());
        assert!(task.transition(TaskStatus::Running).is_err());
        task.transition(TaskStatus::Ready).unwrap();
        task.transition(TaskStatus::Assigned).unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
    }
}
