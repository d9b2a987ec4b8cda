//! Scaling decisions emitted for the external autoscaler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a scaling decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingReason {
    /// Model forecast with sufficient confidence.
    DemandForecast,
    /// Low-confidence forecast blended with the rule-based estimate.
    FallbackRule,
    /// Recorded by an operator.
    Manual,
    /// Advisory, gradual capacity ahead of a longer-horizon forecast.
    PreWarm,
}

impl ScalingReason {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::DemandForecast => "demand_forecast",
            Self::FallbackRule => "fallback_rule",
            Self::Manual => "manual",
            Self::PreWarm => "pre_warm",
        }
    }
}

/// A bounded pool-size target for one agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub agent_type: String,
    pub current_count: u32,
    pub target_count: u32,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub reason: ScalingReason,
    /// Forecast horizon the decision was derived from (0 for manual).
    pub horizon_minutes: u32,
    /// Advisory decisions are applied gradually by the consumer.
    pub advisory: bool,
    pub computed_at: DateTime<Utc>,
    pub apply_at: DateTime<Utc>,
}

impl ScalingDecision {
    /// Signed change in pool size.
    pub fn delta(&self) -> i64 {
        i64::from(self.target_count) - i64::from(self.current_count)
    }
}
