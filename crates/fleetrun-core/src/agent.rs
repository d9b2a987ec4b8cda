//! Agent information types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, CircuitState, CoreError, TaskId};

fn default_max_concurrent() -> u32 {
    1
}

fn default_cost_factor() -> f64 {
    1.0
}

/// Registration request for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<AgentId>,

    /// Pool the agent belongs to; scaling targets are computed per type.
    #[serde(rename = "type")]
    pub agent_type: String,

    /// Task types this agent can serve. Defaults to its own type when empty.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,

    /// Currency per hour.
    #[serde(default = "default_cost_factor")]
    pub cost_factor: f64,

    /// Base URL of the agent's execution endpoint, if reachable over HTTP.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl AgentSpec {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            id: None,
            agent_type: agent_type.into(),
            capabilities: BTreeSet::new(),
            max_concurrent_tasks: default_max_concurrent(),
            cost_factor: default_cost_factor(),
            endpoint: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Builder method to add a served task type.
    pub fn with_capability(mut self, task_type: impl Into<String>) -> Self {
        self.capabilities.insert(task_type.into());
        self
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_cost_factor(mut self, cost: f64) -> Self {
        self.cost_factor = cost;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.agent_type.trim().is_empty() {
            return Err(CoreError::InvalidInput("agent type is required".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(CoreError::InvalidInput(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if !self.cost_factor.is_finite() || self.cost_factor < 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "cost_factor must be non-negative, got {}",
                self.cost_factor
            )));
        }
        Ok(())
    }

    /// Materialize a registered agent.
    pub fn into_agent(self, now: DateTime<Utc>) -> Agent {
        let mut capabilities = self.capabilities;
        if capabilities.is_empty() {
            capabilities.insert(self.agent_type.clone());
        }
        Agent {
            id: self.id.unwrap_or_else(AgentId::generate),
            agent_type: self.agent_type,
            capabilities,
            max_concurrent_tasks: self.max_concurrent_tasks,
            active_tasks: BTreeSet::new(),
            cost_factor: self.cost_factor,
            circuit_state: CircuitState::Closed,
            consecutive_failures: 0,
            last_state_change: now,
            endpoint: self.endpoint,
            registered_at: now,
            last_heartbeat: now,
            missed_heartbeats: 0,
        }
    }
}

/// A registered agent as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,

    #[serde(rename = "type")]
    pub agent_type: String,

    pub capabilities: BTreeSet<String>,

    pub max_concurrent_tasks: u32,

    /// Tasks currently claimed by this agent.
    pub active_tasks: BTreeSet<TaskId>,

    /// Currency per hour.
    pub cost_factor: f64,

    pub circuit_state: CircuitState,

    pub consecutive_failures: u32,

    pub last_state_change: DateTime<Utc>,

    pub endpoint: Option<String>,

    pub registered_at: DateTime<Utc>,

    pub last_heartbeat: DateTime<Utc>,

    pub missed_heartbeats: u32,
}

impl Agent {
    /// Check if this agent serves a given task type.
    pub fn supports(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type)
    }

    /// Fraction of concurrency slots in use, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 1.0;
        }
        self.active_tasks.len() as f64 / self.max_concurrent_tasks as f64
    }

    pub fn has_capacity(&self) -> bool {
        (self.active_tasks.len() as u32) < self.max_concurrent_tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_default_to_type() {
        let agent = AgentSpec::new("codegen").into_agent(Utc::now());
        assert!(agent.supports("codegen"));
        assert!(!agent.supports("docs"));
    }

    #[test]
    fn test_utilization() {
        let mut agent = AgentSpec::new("test")
            .with_max_concurrent(4)
            .into_agent(Utc::now());
        agent.active_tasks.insert(TaskId::new("t1"));
        assert_eq!(agent.utilization(), 0.25);
        assert!(agent.has_capacity());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let spec = AgentSpec::new("test").with_max_concurrent(0);
        assert!(spec.validate().is_err());
    }
}
