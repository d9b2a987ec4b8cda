//! Agent registry.
//!
//! Tracks registered agents, their concurrency slots and circuit breakers, and
//! the observed average task duration per type. Slot reservation is the only
//! way an agent's `active_tasks` grows, and it checks capacity and breaker
//! state under the same write lock, so `active_tasks <= max_concurrent_tasks`
//! holds under any interleaving.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use fleetrun_core::{Agent, AgentId, AgentSpec, CoreError, TaskId};

use crate::executor::AgentExecutor;
use crate::fault::{BreakerSettings, CircuitBreaker};

/// Smoothing factor for the per-type duration average.
const DURATION_EWMA_ALPHA: f64 = 0.2;

/// Why an agent leaves the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeregisterReason {
    /// Operator or agent initiated shutdown.
    #[default]
    Shutdown,
    /// Missed too many heartbeats.
    Unhealthy,
    /// The agent's tasks were finished by another path; nothing to requeue.
    CompletedElsewhere,
}

impl DeregisterReason {
    pub fn requeues_tasks(&self) -> bool {
        !matches!(self, Self::CompletedElsewhere)
    }
}

impl fmt::Display for DeregisterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Shutdown => "shutdown",
            Self::Unhealthy => "unhealthy",
            Self::CompletedElsewhere => "completed_elsewhere",
        })
    }
}

struct AgentEntry {
    agent: Agent,
    breaker: CircuitBreaker,
    executor: Option<Arc<dyn AgentExecutor>>,
}

impl AgentEntry {
    /// Mirror breaker state onto the public agent record.
    fn sync_breaker(&mut self) {
        self.agent.circuit_state = self.breaker.state();
        self.agent.consecutive_failures = self.breaker.consecutive_failures();
        self.agent.last_state_change = self.breaker.last_state_change();
    }
}

#[derive(Default)]
struct RegistryInner {
    agents: HashMap<AgentId, AgentEntry>,
    /// Keyed by task type.
    avg_durations: HashMap<String, f64>,
    /// Keyed by agent type.
    pool_durations: HashMap<String, f64>,
}

impl RegistryInner {
    fn pool_stats(&self) -> BTreeMap<String, PoolStats> {
        let mut pools: BTreeMap<String, PoolStats> = BTreeMap::new();
        for entry in self.agents.values() {
            let a = &entry.agent;
            let stats = pools.entry(a.agent_type.clone()).or_default();
            stats.agents += 1;
            stats.active_tasks += a.active_tasks.len() as u32;
            stats.slots += a.max_concurrent_tasks;
            stats.hourly_cost += a.cost_factor;
            stats.capabilities.extend(a.capabilities.iter().cloned());
        }
        for (agent_type, stats) in pools.iter_mut() {
            stats.avg_duration_secs = self.pool_durations.get(agent_type).copied();
        }
        pools
    }
}

fn fold_duration(averages: &mut HashMap<String, f64>, key: &str, secs: f64) {
    averages
        .entry(key.to_string())
        .and_modify(|avg| *avg = (1.0 - DURATION_EWMA_ALPHA) * *avg + DURATION_EWMA_ALPHA * secs)
        .or_insert(secs);
}

/// Per agent type aggregates used by metrics and the feature extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub agents: u32,
    pub active_tasks: u32,
    pub slots: u32,
    pub hourly_cost: f64,
    /// Task types at least one agent of the pool serves.
    pub capabilities: BTreeSet<String>,
    /// Average task duration observed on the pool's agents.
    pub avg_duration_secs: Option<f64>,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.slots == 0 {
            0.0
        } else {
            self.active_tasks as f64 / self.slots as f64
        }
    }

    /// Average concurrency slots per agent.
    pub fn slots_per_agent(&self) -> f64 {
        if self.agents == 0 {
            1.0
        } else {
            self.slots as f64 / self.agents as f64
        }
    }
}

/// Stable shard assignment for an agent id.
pub fn shard_of(id: &AgentId, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    // FNV-1a: stable across processes, unlike the std hasher.
    let hash = id
        .as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        });
    (hash % shards as u64) as usize
}

pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
    breaker_settings: BreakerSettings,
}

impl AgentRegistry {
    pub fn new(breaker_settings: BreakerSettings) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            breaker_settings,
        }
    }

    /// Register an agent. The executor is optional: agents without one report
    /// results over the API.
    pub async fn register(
        &self,
        spec: AgentSpec,
        executor: Option<Arc<dyn AgentExecutor>>,
        now: DateTime<Utc>,
    ) -> Result<Agent, CoreError> {
        spec.validate()?;
        let agent = spec.into_agent(now);

        let mut inner = self.inner.write().await;
        if inner.agents.contains_key(&agent.id) {
            return Err(CoreError::DuplicateAgent(agent.id));
        }

        info!(
            agent_id = %agent.id,
            agent_type = %agent.agent_type,
            max_concurrent = agent.max_concurrent_tasks,
            "Agent registered"
        );

        let mut entry = AgentEntry {
            agent: agent.clone(),
            breaker: CircuitBreaker::new(self.breaker_settings, now),
            executor,
        };
        entry.sync_breaker();
        inner.agents.insert(agent.id.clone(), entry);
        Ok(agent)
    }

    /// Remove an agent, returning the tasks it held.
    pub async fn deregister(
        &self,
        id: &AgentId,
        reason: DeregisterReason,
    ) -> Result<Vec<TaskId>, CoreError> {
        let entry = self
            .inner
            .write()
            .await
            .agents
            .remove(id)
            .ok_or_else(|| CoreError::AgentNotFound(id.clone()))?;

        let held: Vec<TaskId> = entry.agent.active_tasks.into_iter().collect();
        info!(
            agent_id = %id,
            reason = %reason,
            held_tasks = held.len(),
            "Agent deregistered"
        );
        Ok(held)
    }

    pub async fn get(&self, id: &AgentId) -> Option<Agent> {
        self.inner.read().await.agents.get(id).map(|e| e.agent.clone())
    }

    pub async fn contains(&self, id: &AgentId) -> bool {
        self.inner.read().await.agents.contains_key(id)
    }

    /// All agents, ordered by id.
    pub async fn list(&self) -> Vec<Agent> {
        let inner = self.inner.read().await;
        let mut agents: Vec<Agent> = inner.agents.values().map(|e| e.agent.clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    pub async fn executor(&self, id: &AgentId) -> Option<Arc<dyn AgentExecutor>> {
        self.inner
            .read()
            .await
            .agents
            .get(id)
            .and_then(|e| e.executor.clone())
    }

    /// Agents with an attached executor, for active health probing.
    pub async fn executors(&self) -> Vec<(AgentId, Arc<dyn AgentExecutor>)> {
        self.inner
            .read()
            .await
            .agents
            .iter()
            .filter_map(|(id, e)| e.executor.clone().map(|x| (id.clone(), x)))
            .collect()
    }

    /// Agents of `shard` that can take a task right now.
    ///
    /// Advances expired Open breakers to HalfOpen as a side effect.
    pub async fn candidates(&self, shard: usize, shards: usize, now: DateTime<Utc>) -> Vec<Agent> {
        let mut inner = self.inner.write().await;
        let mut out = Vec::new();
        for entry in inner.agents.values_mut() {
            if shard_of(&entry.agent.id, shards) != shard {
                continue;
            }
            let allowed = entry.breaker.allows_dispatch(now);
            entry.sync_breaker();
            if allowed && entry.agent.has_capacity() {
                out.push(entry.agent.clone());
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Reserve a slot on `agent_id` for `task_id`.
    ///
    /// Returns false if the agent is gone, full, or its breaker refuses.
    pub async fn try_reserve(&self, agent_id: &AgentId, task_id: &TaskId, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.agents.get_mut(agent_id) else {
            return false;
        };
        if !entry.agent.has_capacity() || !entry.breaker.allows_dispatch(now) {
            entry.sync_breaker();
            return false;
        }
        entry.agent.active_tasks.insert(task_id.clone());
        entry.breaker.on_dispatch(task_id);
        entry.sync_breaker();
        true
    }

    /// Give back a slot without recording an outcome.
    pub async fn release(&self, agent_id: &AgentId, task_id: &TaskId) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.agents.get_mut(agent_id) {
            entry.agent.active_tasks.remove(task_id);
            entry.breaker.release_probe(task_id);
            entry.sync_breaker();
        }
    }

    /// Release the slot after a successful execution and fold the duration
    /// into the task type and agent type averages.
    pub async fn record_success(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        task_type: &str,
        duration_secs: Option<f64>,
        now: DateTime<Utc>,
    ) {
        let mut inner = self.inner.write().await;
        let agent_type = inner.agents.get_mut(agent_id).map(|entry| {
            entry.agent.active_tasks.remove(task_id);
            entry.breaker.record_success(now);
            entry.sync_breaker();
            entry.agent.agent_type.clone()
        });
        if let Some(secs) = duration_secs.filter(|s| s.is_finite() && *s >= 0.0) {
            fold_duration(&mut inner.avg_durations, task_type, secs);
            if let Some(agent_type) = agent_type {
                fold_duration(&mut inner.pool_durations, &agent_type, secs);
            }
        }
    }

    /// Release the slot after a failed execution. When `counts` is set the
    /// failure feeds the agent's breaker.
    pub async fn record_failure(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        counts: bool,
        now: DateTime<Utc>,
    ) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.agents.get_mut(agent_id) else {
            return;
        };
        entry.agent.active_tasks.remove(task_id);
        if counts {
            if entry.breaker.record_failure(now) {
                warn!(
                    agent_id = %agent_id,
                    failures = entry.breaker.consecutive_failures(),
                    cooldown_secs = entry.breaker.current_cooldown().num_seconds(),
                    "Circuit breaker opened"
                );
            }
        } else {
            entry.breaker.release_probe(task_id);
        }
        entry.sync_breaker();
    }

    /// Record a heartbeat from an agent.
    pub async fn heartbeat(&self, id: &AgentId, now: DateTime<Utc>) -> Result<Agent, CoreError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .agents
            .get_mut(id)
            .ok_or_else(|| CoreError::AgentNotFound(id.clone()))?;
        entry.agent.last_heartbeat = now;
        entry.agent.missed_heartbeats = 0;
        Ok(entry.agent.clone())
    }

    /// Update missed heartbeat counters and return agents that exceeded
    /// `max_missed` consecutive intervals.
    pub async fn unhealthy(
        &self,
        now: DateTime<Utc>,
        interval: chrono::Duration,
        max_missed: u32,
    ) -> Vec<AgentId> {
        let interval_ms = interval.num_milliseconds().max(1);
        let mut inner = self.inner.write().await;
        let mut out = Vec::new();
        for entry in inner.agents.values_mut() {
            let elapsed_ms = (now - entry.agent.last_heartbeat).num_milliseconds().max(0);
            let missed = u32::try_from(elapsed_ms / interval_ms).unwrap_or(u32::MAX);
            entry.agent.missed_heartbeats = missed;
            if missed >= max_missed && elapsed_ms > interval_ms * max_missed as i64 {
                out.push(entry.agent.id.clone());
            }
        }
        out.sort();
        out
    }

    /// Observed average duration (seconds) for a task type.
    pub async fn avg_duration(&self, task_type: &str) -> Option<f64> {
        self.inner.read().await.avg_durations.get(task_type).copied()
    }

    pub async fn avg_durations(&self) -> BTreeMap<String, f64> {
        self.inner
            .read()
            .await
            .avg_durations
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Aggregates per agent type.
    pub async fn pool_stats(&self) -> BTreeMap<String, PoolStats> {
        self.inner.read().await.pool_stats()
    }

    /// Non-blocking variant of [`pool_stats`](Self::pool_stats); `None` when
    /// the registry is busy.
    pub fn try_pool_stats(&self) -> Option<BTreeMap<String, PoolStats>> {
        self.inner.try_read().ok().map(|inner| inner.pool_stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(BreakerSettings::default())
    }

    async fn add(reg: &AgentRegistry, id: &str, max: u32) -> Agent {
        reg.register(
            AgentSpec::new("build").with_id(id).with_max_concurrent(max),
            None,
            Utc::now(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let reg = registry();
        add(&reg, "a1", 1).await;
        let err = reg
            .register(AgentSpec::new("build").with_id("a1"), None, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::DuplicateAgent(AgentId::new("a1")));
    }

    #[tokio::test]
    async fn test_reserve_respects_capacity() {
        let reg = registry();
        add(&reg, "a1", 2).await;
        let id = AgentId::new("a1");
        let now = Utc::now();

        assert!(reg.try_reserve(&id, &TaskId::new("t1"), now).await);
        assert!(reg.try_reserve(&id, &TaskId::new("t2"), now).await);
        assert!(!reg.try_reserve(&id, &TaskId::new("t3"), now).await);

        reg.release(&id, &TaskId::new("t1")).await;
        assert!(reg.try_reserve(&id, &TaskId::new("t3"), now).await);
        assert_eq!(reg.get(&id).await.unwrap().active_tasks.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_exceed_capacity() {
        let reg = Arc::new(registry());
        add(&reg, "a1", 3).await;

        let mut handles = Vec::new();
        for n in 0..20 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.try_reserve(&AgentId::new("a1"), &TaskId::new(format!("t{n}")), Utc::now())
                    .await
            }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
    }

    #[tokio::test]
    async fn test_deregister_returns_held_tasks() {
        let reg = registry();
        add(&reg, "a1", 2).await;
        let id = AgentId::new("a1");
        reg.try_reserve(&id, &TaskId::new("t1"), Utc::now()).await;

        let held = reg.deregister(&id, DeregisterReason::Shutdown).await.unwrap();
        assert_eq!(held, vec![TaskId::new("t1")]);
        assert!(!reg.contains(&id).await);
        assert!(matches!(
            reg.deregister(&id, DeregisterReason::Shutdown).await,
            Err(CoreError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_breaker_hides_agent_from_candidates() {
        let reg = registry();
        add(&reg, "a1", 10).await;
        let id = AgentId::new("a1");
        let now = Utc::now();

        for n in 0..5 {
            let task = TaskId::new(format!("t{n}"));
            assert!(reg.try_reserve(&id, &task, now).await);
            reg.record_failure(&id, &task, true, now).await;
        }
        assert!(reg.candidates(0, 1, now).await.is_empty());
        assert_eq!(
            reg.get(&id).await.unwrap().circuit_state,
            fleetrun_core::CircuitState::Open
        );

        let later = now + Duration::seconds(60);
        assert_eq!(reg.candidates(0, 1, later).await.len(), 1);
        assert!(reg.try_reserve(&id, &TaskId::new("probe"), later).await);
        assert!(!reg.try_reserve(&id, &TaskId::new("second"), later).await);
    }

    #[tokio::test]
    async fn test_duration_average_is_smoothed() {
        let reg = registry();
        add(&reg, "a1", 1).await;
        let id = AgentId::new("a1");
        let now = Utc::now();

        reg.record_success(&id, &TaskId::new("t1"), "build", Some(100.0), now).await;
        reg.record_success(&id, &TaskId::new("t2"), "build", Some(200.0), now).await;
        let avg = reg.avg_duration("build").await.unwrap();
        assert!((avg - 120.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_pool_stats_keyed_by_agent_type() {
        let reg = registry();
        let now = Utc::now();
        for (id, caps) in [("b1", &["build"][..]), ("b2", &["build", "lint"][..])] {
            let spec = caps
                .iter()
                .fold(AgentSpec::new("builder").with_id(id), |s, c| s.with_capability(*c));
            reg.register(spec, None, now).await.unwrap();
        }
        let b1 = AgentId::new("b1");
        assert!(reg.try_reserve(&b1, &TaskId::new("t1"), now).await);
        reg.record_success(&b1, &TaskId::new("t1"), "build", Some(30.0), now).await;

        let pools = reg.pool_stats().await;
        assert_eq!(pools.keys().collect::<Vec<_>>(), vec!["builder"]);
        let builder = &pools["builder"];
        assert_eq!(builder.agents, 2);
        assert_eq!(
            builder.capabilities.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["build", "lint"]
        );
        assert_eq!(builder.avg_duration_secs, Some(30.0));
    }

    #[tokio::test]
    async fn test_unhealthy_after_missed_heartbeats() {
        let reg = registry();
        let start = Utc::now();
        reg.register(AgentSpec::new("build").with_id("a1"), None, start)
            .await
            .unwrap();

        let interval = Duration::seconds(15);
        assert!(reg.unhealthy(start + Duration::seconds(44), interval, 3).await.is_empty());
        assert_eq!(
            reg.unhealthy(start + Duration::seconds(46), interval, 3).await,
            vec![AgentId::new("a1")]
        );

        reg.heartbeat(&AgentId::new("a1"), start + Duration::seconds(46))
            .await
            .unwrap();
        assert!(reg.unhealthy(start + Duration::seconds(50), interval, 3).await.is_empty());
    }

    #[test]
    fn test_shard_assignment_is_stable() {
        let id = AgentId::new("agent-7");
        assert_eq!(shard_of(&id, 4), shard_of(&id, 4));
        assert!(shard_of(&id, 4) < 4);
        assert_eq!(shard_of(&id, 1), 0);
    }
}
