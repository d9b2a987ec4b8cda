//! Scaling decisions.
//!
//! Turns forecasts into pool-size targets. Decisions are data only: they are
//! recorded and exported, never applied here.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use fleetrun_core::{ScalingDecision, ScalingReason};

use crate::autoscale::forecast::Forecast;
use crate::config::{ScalingConfig, ScalingConstraints};

/// Decisions kept for export.
const DECISION_HISTORY: usize = 256;

/// Current size and cost of one agent pool.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolState {
    pub agents: u32,
    /// Average `cost_factor` of the pool's agents (currency/hour).
    pub cost_per_agent: f64,
}

/// Limit the step from `current` toward a forecast, then clamp to the pool
/// bounds.
///
/// The bounds always hold. A pool that is already outside them is brought
/// back in one step, whatever the step rates.
pub fn clamp_target(current: u32, forecast: u32, c: &ScalingConstraints) -> u32 {
    let stepped = if forecast > current {
        forecast.min(current.saturating_add(c.scale_up_rate))
    } else {
        forecast.max(current.saturating_sub(c.scale_down_rate))
    };
    stepped.clamp(c.min_agents, c.max_agents.max(c.min_agents))
}

fn out_of_bounds(current: u32, c: &ScalingConstraints) -> bool {
    current < c.min_agents || current > c.max_agents.max(c.min_agents)
}

pub struct ScalingEngine {
    config: ScalingConfig,
    last_decision: HashMap<String, DateTime<Utc>>,
    history: VecDeque<ScalingDecision>,
}

impl ScalingEngine {
    pub fn new(config: ScalingConfig) -> Self {
        Self {
            config,
            last_decision: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    fn in_cooldown(&self, agent_type: &str, now: DateTime<Utc>) -> bool {
        let cooldown = Duration::seconds(self.config.cooldown_secs as i64);
        self.last_decision
            .get(agent_type)
            .is_some_and(|at| now - *at < cooldown)
    }

    fn record(&mut self, decision: &ScalingDecision) {
        if self.history.len() == DECISION_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(decision.clone());
    }

    #[allow(clippy::too_many_arguments)]
    fn decision(
        &self,
        agent_type: &str,
        current: u32,
        target: u32,
        confidence: f64,
        reason: ScalingReason,
        horizon_minutes: u32,
        now: DateTime<Utc>,
    ) -> ScalingDecision {
        ScalingDecision {
            agent_type: agent_type.to_string(),
            current_count: current,
            target_count: target,
            confidence,
            reason,
            horizon_minutes,
            advisory: reason == ScalingReason::PreWarm,
            computed_at: now,
            apply_at: now + Duration::seconds(self.config.apply_delay_secs as i64),
        }
    }

    /// Evaluate every pool against `forecast`.
    ///
    /// `primary_horizon` drives the binding decision; the remaining horizons
    /// are only considered for advisory pre-warming.
    pub fn evaluate(
        &mut self,
        forecast: &Forecast,
        pools: &BTreeMap<String, PoolState>,
        primary_horizon: u32,
        now: DateTime<Utc>,
    ) -> Vec<ScalingDecision> {
        let mut fleet_cost: f64 = pools
            .values()
            .map(|p| p.agents as f64 * p.cost_per_agent)
            .sum();

        let agent_types: BTreeSet<&String> = forecast
            .predictions
            .get(&primary_horizon)
            .into_iter()
            .flat_map(|p| p.keys())
            .chain(pools.keys())
            .collect();

        let mut decisions = Vec::new();
        for agent_type in agent_types {
            if self.in_cooldown(agent_type, now) {
                continue;
            }
            let pool = pools.get(agent_type).copied().unwrap_or_default();
            let constraints = self.config.constraints_for(agent_type);
            let Some(predicted) = forecast.prediction(primary_horizon, agent_type) else {
                continue;
            };

            if out_of_bounds(pool.agents, &constraints) {
                warn!(
                    agent_type = %agent_type,
                    current = pool.agents,
                    min_agents = constraints.min_agents,
                    max_agents = constraints.max_agents,
                    "Pool outside its bounds; target clamped regardless of step rates"
                );
            }
            let target = clamp_target(pool.agents, predicted, &constraints);
            let target = self.apply_budget(pool, target, &mut fleet_cost);

            if target != pool.agents {
                let reason = if forecast.blended.get(&primary_horizon).copied().unwrap_or(true) {
                    ScalingReason::FallbackRule
                } else {
                    ScalingReason::DemandForecast
                };
                let decision = self.decision(
                    agent_type,
                    pool.agents,
                    target,
                    forecast.confidence_at(primary_horizon),
                    reason,
                    primary_horizon,
                    now,
                );
                info!(
                    agent_type = %agent_type,
                    current = pool.agents,
                    target = target,
                    reason = reason.as_label(),
                    "Scaling decision"
                );
                self.last_decision.insert(agent_type.clone(), now);
                self.record(&decision);
                decisions.push(decision);
                continue;
            }

            if let Some(decision) =
                self.prewarm(forecast, agent_type, pool, &constraints, primary_horizon, &mut fleet_cost, now)
            {
                info!(
                    agent_type = %agent_type,
                    current = pool.agents,
                    target = decision.target_count,
                    horizon_minutes = decision.horizon_minutes,
                    "Pre-warm advisory"
                );
                self.record(&decision);
                decisions.push(decision);
            }
        }
        decisions
    }

    /// Cap a scale-up so the fleet stays within the hourly budget.
    fn apply_budget(&self, pool: PoolState, target: u32, fleet_cost: &mut f64) -> u32 {
        if target <= pool.agents {
            return target;
        }
        let Some(budget) = self.config.hourly_budget else {
            return target;
        };
        let per_agent = if pool.cost_per_agent > 0.0 {
            pool.cost_per_agent
        } else {
            1.0
        };
        let affordable = ((budget - *fleet_cost) / per_agent).floor().max(0.0) as u32;
        let capped = target.min(pool.agents.saturating_add(affordable));
        *fleet_cost += (capped - pool.agents) as f64 * per_agent;
        capped
    }

    #[allow(clippy::too_many_arguments)]
    fn prewarm(
        &self,
        forecast: &Forecast,
        agent_type: &str,
        pool: PoolState,
        constraints: &ScalingConstraints,
        primary_horizon: u32,
        fleet_cost: &mut f64,
        now: DateTime<Utc>,
    ) -> Option<ScalingDecision> {
        let step = (constraints.scale_up_rate / 2).max(1);
        for (&horizon, per_type) in &forecast.predictions {
            if horizon <= primary_horizon {
                continue;
            }
            let confidence = forecast.confidence_at(horizon);
            let Some(&predicted) = per_type.get(agent_type) else {
                continue;
            };
            let threshold = pool.agents as f64 * (1.0 + self.config.prewarm_margin);
            if confidence < self.config.prewarm_confidence
                || predicted <= pool.agents
                || (predicted as f64) < threshold
            {
                continue;
            }

            let target = pool
                .agents
                .saturating_add(step)
                .min(predicted)
                .min(constraints.max_agents);
            let target = self.apply_budget(pool, target, fleet_cost);
            if target <= pool.agents {
                return None;
            }
            return Some(self.decision(
                agent_type,
                pool.agents,
                target,
                confidence,
                ScalingReason::PreWarm,
                horizon,
                now,
            ));
        }
        None
    }

    /// Record an operator decision. It is bounded by the pool limits but not
    /// by the step rates, and starts the cooldown for the type.
    pub fn manual(
        &mut self,
        agent_type: &str,
        current: u32,
        target: u32,
        now: DateTime<Utc>,
    ) -> ScalingDecision {
        let c = self.config.constraints_for(agent_type);
        let target = target.clamp(c.min_agents, c.max_agents.max(c.min_agents));
        let decision = self.decision(agent_type, current, target, 1.0, ScalingReason::Manual, 0, now);
        info!(agent_type = %agent_type, current, target, "Manual scaling decision");
        self.last_decision.insert(agent_type.to_string(), now);
        self.record(&decision);
        decision
    }

    /// Most recent decisions, newest last.
    pub fn decisions(&self, limit: usize) -> Vec<ScalingDecision> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// Latest binding (non-advisory) decision per agent type.
    pub fn latest_targets(&self) -> BTreeMap<String, ScalingDecision> {
        let mut latest = BTreeMap::new();
        for d in self.history.iter().filter(|d| !d.advisory) {
            latest.insert(d.agent_type.clone(), d.clone());
        }
        latest
    }
}
