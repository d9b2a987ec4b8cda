//! FleetRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Storage backends
//! - Runtime specifics
//!
//! Everything the orchestrator, its client and the CLI exchange is defined here.

pub mod agent;
pub mod dead_letter;
pub mod error;
pub mod failure;
pub mod ids;
pub mod priority;
pub mod report;
pub mod scaling;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use agent::{Agent, AgentSpec};
pub use dead_letter::DeadLetterEntry;
pub use error::CoreError;
pub use failure::{FailureKind, TaskFailure};
pub use ids::{AgentId, DeadLetterId, TaskId};
pub use priority::Priority;
pub use report::{
    CompletionReport, DeregisterResponse, ErrorResponse, FailureReport, ManualScalingRequest,
    SubmitRequest, SubmitResponse, TaskAccepted,
};
pub use scaling::{ScalingDecision, ScalingReason};
pub use status::{CircuitState, TaskStatus};
pub use task::{AttemptRecord, Task, TaskSpec};
