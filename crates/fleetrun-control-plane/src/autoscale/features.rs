//! Feature extraction.
//!
//! The orchestrator records submission activity as it happens; on each
//! sampling tick it hands over a [`MetricSnapshot`] of whatever sources were
//! available without waiting. The extractor turns that into a flat, named
//! feature vector. Sources missing from a snapshot fall back to the last value
//! seen for the same feature, or 0, so extraction never fails.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use fleetrun_core::{Priority, Task};

use crate::registry::PoolStats;

/// Submissions remembered for the complexity and dependency statistics.
const RECENT_SUBMISSIONS: usize = 1000;

/// Longest arrival-rate window.
const ARRIVAL_HORIZON_MINUTES: i64 = 15;

pub const ARRIVAL_RATE_1M: &str = "arrival_rate_1m";
pub const ARRIVAL_RATE_5M: &str = "arrival_rate_5m";
pub const ARRIVAL_RATE_15M: &str = "arrival_rate_15m";
pub const QUEUE_DEPTH_TOTAL: &str = "queue_depth_total";
pub const COMPLEXITY_MEAN: &str = "complexity_mean";
pub const COMPLEXITY_P50: &str = "complexity_p50";
pub const COMPLEXITY_P90: &str = "complexity_p90";
pub const DEPENDENCY_RATIO: &str = "dependency_ratio";

pub fn queue_depth_key(priority: Priority) -> String {
    format!("queue_depth_{}", priority.as_label())
}

/// Per agent type feature names.
pub mod pool {
    pub const AGENTS: &str = "agents";
    pub const UTILIZATION: &str = "utilization";
    pub const AVG_DURATION_SECS: &str = "avg_duration_secs";
    /// Active tasks plus the pool's share of queued work.
    pub const DEMAND: &str = "demand";
    pub const SLOTS_PER_AGENT: &str = "slots_per_agent";

    pub fn key(agent_type: &str, feature: &str) -> String {
        format!("pool.{agent_type}.{feature}")
    }

    /// Agent type of a pool feature key.
    pub fn type_of(key: &str) -> Option<&str> {
        key.strip_prefix("pool.")?.rsplit_once('.').map(|(t, _)| t)
    }
}

#[derive(Debug, Clone, Copy)]
struct Submission {
    at: DateTime<Utc>,
    complexity: f64,
    has_dependencies: bool,
}

/// Rolling record of task submissions.
#[derive(Default)]
pub struct ActivityRecorder {
    recent: Mutex<VecDeque<Submission>>,
}

/// Arrival counts over the standard windows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ArrivalCounts {
    pub last_1m: usize,
    pub last_5m: usize,
    pub last_15m: usize,
}

/// Distribution of submitted complexity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ComplexityStats {
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
}

impl ActivityRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submission(&self, tasks: &[Task], at: DateTime<Utc>) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks {
            recent.push_back(Submission {
                at,
                complexity: task.estimated_complexity,
                has_dependencies: !task.dependencies.is_empty(),
            });
        }
        let horizon = at - Duration::minutes(ARRIVAL_HORIZON_MINUTES);
        while recent.len() > RECENT_SUBMISSIONS
            && recent.front().is_some_and(|s| s.at < horizon)
        {
            recent.pop_front();
        }
    }

    /// Arrivals within 1, 5 and 15 minutes of `now`.
    pub fn arrivals(&self, now: DateTime<Utc>) -> ArrivalCounts {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let within = |minutes: i64| {
            let since = now - Duration::minutes(minutes);
            recent.iter().rev().take_while(|s| s.at > since).count()
        };
        ArrivalCounts {
            last_1m: within(1),
            last_5m: within(5),
            last_15m: within(ARRIVAL_HORIZON_MINUTES),
        }
    }

    /// Complexity distribution over recent submissions; `None` before the first.
    pub fn complexity(&self) -> Option<ComplexityStats> {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let mut values: Vec<f64> = recent
            .iter()
            .rev()
            .take(RECENT_SUBMISSIONS)
            .map(|s| s.complexity)
            .collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Some(ComplexityStats {
            mean,
            p50: percentile(&values, 0.5),
            p90: percentile(&values, 0.9),
        })
    }

    /// Share of recent submissions that declared dependencies.
    pub fn dependency_ratio(&self) -> Option<f64> {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let sample: Vec<&Submission> = recent.iter().rev().take(RECENT_SUBMISSIONS).collect();
        if sample.is_empty() {
            return None;
        }
        let with_deps = sample.iter().filter(|s| s.has_dependencies).count();
        Some(with_deps as f64 / sample.len() as f64)
    }
}

/// Nearest-rank percentile of sorted values.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Demand per agent type: the pool's active tasks plus an even share of each
/// queued task type among the pools whose agents serve it.
///
/// Work no pool can serve is counted toward a pool named after its task
/// type, the pool an agent registered without explicit capabilities joins.
fn pool_demand(
    pools: &BTreeMap<String, PoolStats>,
    queued: &BTreeMap<String, usize>,
) -> BTreeMap<String, f64> {
    let mut demand: BTreeMap<String, f64> = pools
        .iter()
        .map(|(agent_type, stats)| (agent_type.clone(), stats.active_tasks as f64))
        .collect();
    for (task_type, &waiting) in queued {
        let serving: Vec<&String> = pools
            .iter()
            .filter(|(_, stats)| stats.capabilities.contains(task_type))
            .map(|(agent_type, _)| agent_type)
            .collect();
        if serving.is_empty() {
            *demand.entry(task_type.clone()).or_insert(0.0) += waiting as f64;
            continue;
        }
        let share = waiting as f64 / serving.len() as f64;
        for agent_type in serving {
            *demand.entry(agent_type.clone()).or_insert(0.0) += share;
        }
    }
    demand
}

/// Raw readings gathered for one sample. `None` marks a source that could not
/// be read without blocking.
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub arrivals: Option<ArrivalCounts>,
    pub queue_depths: Option<Vec<(Priority, usize)>>,
    pub queued_by_type: Option<BTreeMap<String, usize>>,
    pub pools: Option<BTreeMap<String, PoolStats>>,
    pub complexity: Option<ComplexityStats>,
    pub dependency_ratio: Option<f64>,
}

/// One sampled feature vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl FeatureVector {
    /// Value of a feature, 0 when absent.
    pub fn get(&self, key: &str) -> f64 {
        self.values.get(key).copied().unwrap_or(0.0)
    }

    pub fn pool(&self, agent_type: &str, feature: &str) -> f64 {
        self.get(&pool::key(agent_type, feature))
    }

    /// Agent types that appear in the vector.
    pub fn agent_types(&self) -> Vec<String> {
        let types: BTreeSet<&str> = self
            .values
            .keys()
            .filter_map(|k| pool::type_of(k))
            .collect();
        types.into_iter().map(str::to_string).collect()
    }

    /// Agents needed to serve the current demand of a type.
    pub fn required_agents(&self, agent_type: &str) -> f64 {
        let per_agent = self.pool(agent_type, pool::SLOTS_PER_AGENT).max(1.0);
        self.pool(agent_type, pool::DEMAND) / per_agent
    }
}

/// Builds feature vectors and keeps a bounded history.
pub struct FeatureExtractor {
    last_known: BTreeMap<String, f64>,
    history: VecDeque<FeatureVector>,
    history_len: usize,
}

impl FeatureExtractor {
    pub fn new(history_len: usize) -> Self {
        Self {
            last_known: BTreeMap::new(),
            history: VecDeque::with_capacity(history_len.min(4096)),
            history_len: history_len.max(1),
        }
    }

    /// Turn a snapshot into a feature vector and append it to the history.
    pub fn extract(&mut self, snapshot: &MetricSnapshot) -> FeatureVector {
        let mut values = self.last_known.clone();
        for key in [
            ARRIVAL_RATE_1M,
            ARRIVAL_RATE_5M,
            ARRIVAL_RATE_15M,
            QUEUE_DEPTH_TOTAL,
            COMPLEXITY_MEAN,
            COMPLEXITY_P50,
            COMPLEXITY_P90,
            DEPENDENCY_RATIO,
        ] {
            values.entry(key.to_string()).or_insert(0.0);
        }
        for priority in Priority::DESCENDING {
            values.entry(queue_depth_key(priority)).or_insert(0.0);
        }

        if let Some(a) = snapshot.arrivals {
            values.insert(ARRIVAL_RATE_1M.into(), a.last_1m as f64);
            values.insert(ARRIVAL_RATE_5M.into(), a.last_5m as f64 / 5.0);
            values.insert(ARRIVAL_RATE_15M.into(), a.last_15m as f64 / 15.0);
        }

        if let Some(depths) = &snapshot.queue_depths {
            let mut total = 0;
            for (priority, depth) in depths {
                values.insert(queue_depth_key(*priority), *depth as f64);
                total += depth;
            }
            values.insert(QUEUE_DEPTH_TOTAL.into(), total as f64);
        }

        if let Some(c) = snapshot.complexity {
            values.insert(COMPLEXITY_MEAN.into(), c.mean);
            values.insert(COMPLEXITY_P50.into(), c.p50);
            values.insert(COMPLEXITY_P90.into(), c.p90);
        }

        if let Some(ratio) = snapshot.dependency_ratio {
            values.insert(DEPENDENCY_RATIO.into(), ratio);
        }

        if let Some(pools) = &snapshot.pools {
            // Demand needs both the pool and queue readings of this sample.
            let demand = snapshot
                .queued_by_type
                .as_ref()
                .map(|queued| pool_demand(pools, queued));

            // Pools that are gone from this reading stop being reported.
            values.retain(|key, _| {
                pool::type_of(key).map_or(true, |agent_type| {
                    pools.contains_key(agent_type)
                        || demand.as_ref().is_some_and(|d| d.contains_key(agent_type))
                })
            });

            for (agent_type, stats) in pools {
                values.insert(pool::key(agent_type, pool::AGENTS), stats.agents as f64);
                values.insert(pool::key(agent_type, pool::UTILIZATION), stats.utilization());
                values.insert(
                    pool::key(agent_type, pool::SLOTS_PER_AGENT),
                    stats.slots_per_agent(),
                );
                if let Some(secs) = stats.avg_duration_secs {
                    values.insert(pool::key(agent_type, pool::AVG_DURATION_SECS), secs);
                }
            }

            for (agent_type, demand) in demand.into_iter().flatten() {
                values.insert(pool::key(&agent_type, pool::DEMAND), demand);
                values
                    .entry(pool::key(&agent_type, pool::AGENTS))
                    .or_insert(0.0);
                values
                    .entry(pool::key(&agent_type, pool::SLOTS_PER_AGENT))
                    .or_insert(1.0);
            }
        }

        self.last_known = values.clone();
        let vector = FeatureVector {
            timestamp: snapshot.timestamp,
            values,
        };
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(vector.clone());
        vector
    }

    pub fn latest(&self) -> Option<&FeatureVector> {
        self.history.back()
    }

    pub fn history(&self) -> &VecDeque<FeatureVector> {
        &self.history
    }
}
