//! Agent selection policies.
//!
//! A policy scores each eligible agent for a task; lower is better and `None`
//! excludes the agent. [`rank`] applies the shared ordering rules on top of the
//! policy's scores.

use std::cmp::Ordering;
use std::collections::HashSet;

use fleetrun_core::{Agent, AgentId, Task};

use crate::config::{DispatchConfig, PolicyKind};

/// Inputs a policy may need beyond the task and the agent.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    /// Observed average duration for the task's type, in seconds.
    pub avg_task_duration_secs: f64,
    pub utilization_penalty: f64,
}

pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score `agent` for `task`; lower is better, `None` means ineligible.
    fn score(&self, task: &Task, agent: &Agent, ctx: &SelectionContext) -> Option<f64>;
}

/// Prefers the agent with the lowest `active / max` ratio.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastBusy;

impl SelectionPolicy for LeastBusy {
    fn name(&self) -> &'static str {
        "least_busy"
    }

    fn score(&self, _task: &Task, agent: &Agent, _ctx: &SelectionContext) -> Option<f64> {
        Some(agent.utilization())
    }
}

/// Prefers the cheapest projected execution, excluding agents whose projected
/// cost exceeds the task's budget.
#[derive(Debug, Default, Clone, Copy)]
pub struct CostBased;

impl CostBased {
    /// Cost of running the task on the agent, before the utilization penalty.
    pub fn projected_cost(task: &Task, agent: &Agent, ctx: &SelectionContext) -> f64 {
        agent.cost_factor * (ctx.avg_task_duration_secs * task.estimated_complexity / 3600.0)
    }
}

impl SelectionPolicy for CostBased {
    fn name(&self) -> &'static str {
        "cost_based"
    }

    fn score(&self, task: &Task, agent: &Agent, ctx: &SelectionContext) -> Option<f64> {
        let cost = Self::projected_cost(task, agent, ctx);
        if task.cost_budget.is_some_and(|budget| cost > budget) {
            return None;
        }
        Some(cost * (1.0 + ctx.utilization_penalty * agent.utilization()))
    }
}

/// Build the policy selected in configuration.
pub fn policy_from_config(config: &DispatchConfig) -> Box<dyn SelectionPolicy> {
    match config.policy {
        PolicyKind::LeastBusy => Box::new(LeastBusy),
        PolicyKind::CostBased => Box::new(CostBased),
    }
}

/// Order eligible agents for `task`, best first.
///
/// Agents that already failed the task go last; ties on score break on the
/// lower `cost_factor`, then on id.
pub fn rank(
    policy: &dyn SelectionPolicy,
    task: &Task,
    agents: &[Agent],
    ctx: &SelectionContext,
) -> Vec<AgentId> {
    let failed: HashSet<&AgentId> = task.failed_agents().collect();

    let mut scored: Vec<(bool, f64, &Agent)> = agents
        .iter()
        .filter(|a| a.supports(&task.task_type) && a.has_capacity())
        .filter_map(|a| {
            policy
                .score(task, a, ctx)
                .filter(|s| s.is_finite())
                .map(|s| (failed.contains(&a.id), s, a))
        })
        .collect();

    scored.sort_by(|(fa, sa, a), (fb, sb, b)| {
        fa.cmp(fb)
            .then(sa.partial_cmp(sb).unwrap_or(Ordering::Equal))
            .then(a.cost_factor.partial_cmp(&b.cost_factor).unwrap_or(Ordering::Equal))
            .then_with(|| a.id.cmp(&b.id))
    });

    scored.into_iter().map(|(_, _, a)| a.id.clone()).collect()
}
