//! Control plane configuration.
//!
//! Every field has a default, so an empty TOML file (or no file at all) yields a
//! working configuration. Sections mirror the components they tune.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use fleetrun_core::AgentSpec;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Control plane configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub fault: FaultConfig,
    pub health: HealthConfig,
    pub features: FeatureConfig,
    pub forecast: ForecastConfig,
    pub scaling: ScalingConfig,

    /// Agents registered at startup.
    pub agents: Vec<AgentSpec>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.queue.capacity == 0 {
            return invalid("queue.capacity must be at least 1".into());
        }
        if !(self.queue.shed_threshold > 0.0 && self.queue.shed_threshold <= 1.0) {
            return invalid(format!(
                "queue.shed_threshold must be in (0, 1], got {}",
                self.queue.shed_threshold
            ));
        }
        if self.dispatch.shards == 0 {
            return invalid("dispatch.shards must be at least 1".into());
        }
        if self.fault.failure_threshold == 0 || self.fault.max_attempts == 0 {
            return invalid("fault.failure_threshold and fault.max_attempts must be at least 1".into());
        }
        if self.fault.max_cooldown_secs < self.fault.cooldown_secs {
            return invalid("fault.max_cooldown_secs must be >= fault.cooldown_secs".into());
        }
        if self.features.sample_interval_secs == 0 || self.features.history_len == 0 {
            return invalid("features.sample_interval_secs and features.history_len must be positive".into());
        }
        if self.forecast.horizons.is_empty() {
            return invalid("forecast.horizons must not be empty".into());
        }
        if (self.forecast.model_weight + self.forecast.rule_weight - 1.0).abs() > 1e-6 {
            return invalid(format!(
                "forecast.model_weight + forecast.rule_weight must be 1, got {}",
                self.forecast.model_weight + self.forecast.rule_weight
            ));
        }
        for (name, value) in [
            ("forecast.confidence_threshold", self.forecast.confidence_threshold),
            ("forecast.alpha", self.forecast.alpha),
            ("forecast.beta", self.forecast.beta),
            ("scaling.prewarm_confidence", self.scaling.prewarm_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be in [0, 1], got {value}"));
            }
        }
        let pools = std::iter::once(("default", &self.scaling.default_constraints))
            .chain(self.scaling.pools.iter().map(|(k, v)| (k.as_str(), v)));
        for (pool, c) in pools {
            if c.min_agents > c.max_agents {
                return invalid(format!(
                    "scaling pool '{pool}': min_agents {} > max_agents {}",
                    c.min_agents, c.max_agents
                ));
            }
        }
        Ok(())
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP API bind address.
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Priority queue capacity and load shedding.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued tasks.
    pub capacity: usize,

    /// Utilization at which new submissions are shed.
    pub shed_threshold: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            shed_threshold: 0.9,
        }
    }
}

/// Agent selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    LeastBusy,
    CostBased,
}

/// Dispatch loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of dispatch loops; agents are partitioned across them.
    pub shards: usize,

    /// Idle wait between polls when nothing could be dispatched (milliseconds).
    pub poll_interval_ms: u64,

    pub policy: PolicyKind,

    /// Weight of agent utilization in the cost-based score.
    pub utilization_penalty: f64,

    /// Task duration assumed before any completion of a type was observed.
    pub default_task_duration_secs: f64,

    /// Default execution SLA for Running tasks without a deadline.
    pub default_sla_secs: u64,

    /// Per task type SLA overrides.
    pub sla_overrides: HashMap<String, u64>,

    /// How long a cancelled Running task may take to acknowledge.
    pub cancel_grace_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            shards: 1,
            poll_interval_ms: 100,
            policy: PolicyKind::LeastBusy,
            utilization_penalty: 0.5,
            default_task_duration_secs: 60.0,
            default_sla_secs: 300,
            sla_overrides: HashMap::new(),
            cancel_grace_secs: 30,
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// SLA applied to a task type.
    pub fn sla_for(&self, task_type: &str) -> chrono::Duration {
        let secs = self
            .sla_overrides
            .get(task_type)
            .copied()
            .unwrap_or(self.default_sla_secs);
        chrono::Duration::seconds(secs as i64)
    }
}

/// Circuit breaker and retry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Consecutive failures that open an agent's breaker.
    pub failure_threshold: u32,

    /// Initial Open duration.
    pub cooldown_secs: u64,

    /// Cap for the doubled cooldown after failed probes.
    pub max_cooldown_secs: u64,

    /// Executions a task may consume before it is dead-lettered.
    pub max_attempts: u32,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            max_cooldown_secs: 600,
            max_attempts: 3,
        }
    }
}

/// Agent health tracking.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Expected heartbeat interval from agents (seconds).
    pub heartbeat_interval_secs: u64,

    /// Missed heartbeats before an agent is deregistered.
    pub max_missed_heartbeats: u32,

    /// Interval of the timeout / health sweep (seconds).
    pub sweep_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            max_missed_heartbeats: 3,
            sweep_interval_secs: 5,
        }
    }
}

/// Feature extraction cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub sample_interval_secs: u64,

    /// Number of feature vectors kept for forecasting.
    pub history_len: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 60,
            history_len: 1440,
        }
    }
}

/// Forecast engine and fallback blending.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Horizons in minutes; the first one drives scaling decisions.
    pub horizons: Vec<u32>,

    /// Below this confidence the model output is blended with the rule.
    pub confidence_threshold: f64,

    pub model_weight: f64,
    pub rule_weight: f64,

    /// Level smoothing factor.
    pub alpha: f64,

    /// Trend smoothing factor.
    pub beta: f64,

    /// Samples needed before the model reaches full confidence.
    pub min_history: usize,

    /// Confidence multiplier per additional 15 minutes of horizon.
    pub horizon_decay: f64,

    /// Clamp for the rule-based growth factor.
    pub min_growth: f64,
    pub max_growth: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizons: vec![15, 30, 60],
            confidence_threshold: 0.8,
            model_weight: 0.7,
            rule_weight: 0.3,
            alpha: 0.5,
            beta: 0.3,
            min_history: 5,
            horizon_decay: 0.95,
            min_growth: 0.5,
            max_growth: 2.0,
        }
    }
}

/// Pool bounds for one agent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScalingConstraints {
    pub min_agents: u32,
    pub max_agents: u32,

    /// Maximum increase per decision cycle.
    pub scale_up_rate: u32,

    /// Maximum decrease per decision cycle.
    pub scale_down_rate: u32,
}

impl Default for ScalingConstraints {
    fn default() -> Self {
        Self {
            min_agents: 1,
            max_agents: 20,
            scale_up_rate: 5,
            scale_down_rate: 2,
        }
    }
}

/// Scaling decision engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub interval_secs: u64,

    /// Minimum time between two decisions for the same agent type.
    pub cooldown_secs: u64,

    /// Delay between computing a decision and its `apply_at`.
    pub apply_delay_secs: u64,

    pub prewarm_confidence: f64,

    /// Relative excess of forecast over current capacity that triggers pre-warming.
    pub prewarm_margin: f64,

    /// Upper bound on fleet cost (currency/hour) when scaling up.
    pub hourly_budget: Option<f64>,

    pub default_constraints: ScalingConstraints,

    /// Per agent type overrides.
    pub pools: BTreeMap<String, ScalingConstraints>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            cooldown_secs: 120,
            apply_delay_secs: 10,
            prewarm_confidence: 0.85,
            prewarm_margin: 0.3,
            hourly_budget: None,
            default_constraints: ScalingConstraints::default(),
            pools: BTreeMap::new(),
        }
    }
}

impl ScalingConfig {
    pub fn constraints_for(&self, agent_type: &str) -> ScalingConstraints {
        self.pools
            .get(agent_type)
            .copied()
            .unwrap_or(self.default_constraints)
    }
}
