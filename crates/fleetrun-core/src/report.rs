//! Messages exchanged between agents, clients and the orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AgentId, TaskFailure, TaskId, TaskSpec, TaskStatus};

/// Per-task acceptance returned for a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub id: TaskId,
    pub status: TaskStatus,
}

/// Successful execution reported by (or on behalf of) an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub agent_id: AgentId,

    /// Claim the report refers to. Reports for an older claim are rejected;
    /// when absent the current claim of `agent_id` is assumed.
    #[serde(default)]
    pub claim_version: Option<u64>,

    #[serde(default)]
    pub result: Value,
}

/// Failed execution reported by (or on behalf of) an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub agent_id: AgentId,

    #[serde(default)]
    pub claim_version: Option<u64>,

    pub failure: TaskFailure,
}

/// Body of a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub tasks: Vec<TaskAccepted>,
}

/// Result of removing an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterResponse {
    pub agent_id: AgentId,
    /// Tasks the agent held that went back to the queue.
    pub requeued: Vec<TaskId>,
}

/// Operator-set pool target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualScalingRequest {
    pub agent_type: String,
    pub target: u32,
}

/// Error body returned by the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
