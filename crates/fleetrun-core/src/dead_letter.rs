//! Dead-letter entries for tasks that failed terminally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AttemptRecord, DeadLetterId, Priority, Task, TaskId, TaskSpec};

/// Immutable record of a task that exhausted retries or failed non-retryably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub task_id: TaskId,
    pub task_type: String,
    pub payload: Value,
    pub priority: Priority,
    pub estimated_complexity: f64,
    pub cost_budget: Option<f64>,
    pub failure_reason: String,
    pub attempt_history: Vec<AttemptRecord>,
    pub enqueued_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Capture a task's payload and full attempt history.
    pub fn from_task(task: &Task, failure_reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: DeadLetterId::generate(),
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            priority: task.priority,
            estimated_complexity: task.estimated_complexity,
            cost_budget: task.cost_budget,
            failure_reason: failure_reason.into(),
            attempt_history: task.attempt_history.clone(),
            enqueued_at: at,
        }
    }

    /// Descriptor for a fresh task (new id, no dependencies) built from the
    /// stored payload.
    pub fn to_spec(&self) -> TaskSpec {
        TaskSpec {
            id: None,
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            dependencies: Default::default(),
            estimated_complexity: self.estimated_complexity,
            deadline: None,
            cost_budget: self.cost_budget,
        }
    }
}
