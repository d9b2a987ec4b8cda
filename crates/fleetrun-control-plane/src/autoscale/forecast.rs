//! Demand forecasting.
//!
//! A [`ForecastModel`] projects the number of agents each type will need at a
//! given horizon, with a confidence score. When confidence is below the
//! configured threshold the model output is blended with a rule-based estimate
//! derived from arrival-rate acceleration.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::autoscale::features::{self, FeatureVector};
use crate::config::{ForecastConfig, ScalingConstraints};

/// Output of a model for one agent type and horizon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrediction {
    /// Agents needed, non-negative.
    pub agents: f64,
    /// In `[0, 1]`.
    pub confidence: f64,
}

pub trait ForecastModel: Send + Sync {
    /// Identifies the model in exported forecasts.
    fn version(&self) -> &str;

    /// Predict the agents `agent_type` needs `steps` samples after the last
    /// entry of `history`. `horizon_minutes` is the same horizon in minutes.
    fn predict(
        &self,
        history: &VecDeque<FeatureVector>,
        agent_type: &str,
        steps: u32,
        horizon_minutes: u32,
    ) -> ModelPrediction;
}

/// Double exponential smoothing (level and trend) over required agents.
#[derive(Debug, Clone)]
pub struct HoltModel {
    alpha: f64,
    beta: f64,
    min_history: usize,
    horizon_decay: f64,
}

impl HoltModel {
    pub fn new(config: &ForecastConfig) -> Self {
        Self {
            alpha: config.alpha,
            beta: config.beta,
            min_history: config.min_history.max(1),
            horizon_decay: config.horizon_decay,
        }
    }
}

impl ForecastModel for HoltModel {
    fn version(&self) -> &str {
        "holt-v1"
    }

    fn predict(
        &self,
        history: &VecDeque<FeatureVector>,
        agent_type: &str,
        steps: u32,
        horizon_minutes: u32,
    ) -> ModelPrediction {
        let series: Vec<f64> = history.iter().map(|v| v.required_agents(agent_type)).collect();
        let Some((&first, rest)) = series.split_first() else {
            return ModelPrediction {
                agents: 0.0,
                confidence: 0.0,
            };
        };

        let mut level = first;
        let mut trend = 0.0;
        let mut error_sum = 0.0;
        for &actual in rest {
            let expected = level + trend;
            error_sum += ((actual - expected).abs() / actual.abs().max(1.0)).min(1.0);

            let prev_level = level;
            level = self.alpha * actual + (1.0 - self.alpha) * (level + trend);
            trend = self.beta * (level - prev_level) + (1.0 - self.beta) * trend;
        }

        let mean_error = if rest.is_empty() {
            0.0
        } else {
            error_sum / rest.len() as f64
        };
        let coverage = (series.len() as f64 / self.min_history as f64).min(1.0);
        let decay_steps = (horizon_minutes as f64 / 15.0 - 1.0).max(0.0);
        let confidence =
            ((1.0 - mean_error) * coverage * self.horizon_decay.powf(decay_steps)).clamp(0.0, 1.0);

        ModelPrediction {
            agents: (level + trend * steps as f64).max(0.0),
            confidence,
        }
    }
}

/// Rule-based estimate: current count scaled by the arrival acceleration
/// (5-minute vs 15-minute rate), compounded per 15 minutes of horizon and
/// clamped to the pool bounds.
pub fn rule_estimate(
    latest: &FeatureVector,
    agent_type: &str,
    horizon_minutes: u32,
    constraints: &ScalingConstraints,
    config: &ForecastConfig,
) -> u32 {
    let rate_5m = latest.get(features::ARRIVAL_RATE_5M);
    let rate_15m = latest.get(features::ARRIVAL_RATE_15M);
    let growth = if rate_15m > 0.0 {
        (rate_5m / rate_15m).clamp(config.min_growth, config.max_growth)
    } else {
        1.0
    };
    let current = latest.pool(agent_type, features::pool::AGENTS);
    let projected = current * growth.powf(horizon_minutes as f64 / 15.0);
    (projected.round().max(0.0) as u32).clamp(constraints.min_agents, constraints.max_agents)
}

/// Confidence-gated blend of model and rule outputs.
pub fn blend(model: u32, rule: u32, confidence: f64, config: &ForecastConfig) -> u32 {
    if confidence >= config.confidence_threshold {
        return model;
    }
    (config.model_weight * model as f64 + config.rule_weight * rule as f64)
        .round()
        .max(0.0) as u32
}

/// Forecast for all agent types across the configured horizons.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub timestamp: DateTime<Utc>,
    /// horizon minutes -> agent type -> agents.
    pub predictions: BTreeMap<u32, BTreeMap<String, u32>>,
    /// horizon minutes -> confidence, the lowest across agent types.
    pub confidence: BTreeMap<u32, f64>,
    /// horizon minutes -> whether the rule fallback was blended in.
    pub blended: BTreeMap<u32, bool>,
    pub model_version: String,
}

impl Forecast {
    pub fn prediction(&self, horizon: u32, agent_type: &str) -> Option<u32> {
        self.predictions.get(&horizon)?.get(agent_type).copied()
    }

    pub fn confidence_at(&self, horizon: u32) -> f64 {
        self.confidence.get(&horizon).copied().unwrap_or(0.0)
    }
}

pub struct ForecastEngine {
    model: Box<dyn ForecastModel>,
    config: ForecastConfig,
    sample_interval_secs: u64,
}

impl ForecastEngine {
    pub fn new(model: Box<dyn ForecastModel>, config: ForecastConfig, sample_interval_secs: u64) -> Self {
        Self {
            model,
            config,
            sample_interval_secs: sample_interval_secs.max(1),
        }
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    fn steps_for(&self, horizon_minutes: u32) -> u32 {
        let steps = (horizon_minutes as u64 * 60).div_ceil(self.sample_interval_secs);
        u32::try_from(steps).unwrap_or(u32::MAX).max(1)
    }

    /// Predict per-type agent counts for each horizon.
    pub fn predict<C>(
        &self,
        timestamp: DateTime<Utc>,
        history: &VecDeque<FeatureVector>,
        horizons: &[u32],
        constraints: C,
    ) -> Forecast
    where
        C: Fn(&str) -> ScalingConstraints,
    {
        let mut forecast = Forecast {
            timestamp,
            predictions: BTreeMap::new(),
            confidence: BTreeMap::new(),
            blended: BTreeMap::new(),
            model_version: self.model.version().to_string(),
        };

        let Some(latest) = history.back() else {
            for &h in horizons {
                forecast.predictions.insert(h, BTreeMap::new());
                forecast.confidence.insert(h, 0.0);
                forecast.blended.insert(h, false);
            }
            return forecast;
        };
        let agent_types = latest.agent_types();

        for &horizon in horizons {
            let steps = self.steps_for(horizon);
            let raw: Vec<(&String, ModelPrediction)> = agent_types
                .iter()
                .map(|t| (t, self.model.predict(history, t, steps, horizon)))
                .collect();

            let confidence = raw
                .iter()
                .map(|(_, p)| p.confidence)
                .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.min(c))))
                .unwrap_or(0.0);
            let blended = confidence < self.config.confidence_threshold;

            let per_type = raw
                .into_iter()
                .map(|(agent_type, prediction)| {
                    let model = prediction.agents.round() as u32;
                    let value = if blended {
                        let rule = rule_estimate(
                            latest,
                            agent_type,
                            horizon,
                            &constraints(agent_type.as_str()),
                            &self.config,
                        );
                        blend(model, rule, confidence, &self.config)
                    } else {
                        model
                    };
                    (agent_type.clone(), value)
                })
                .collect();

            forecast.predictions.insert(horizon, per_type);
            forecast.confidence.insert(horizon, confidence);
            forecast.blended.insert(horizon, blended);
        }
        forecast
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscale::features::pool;

    fn config() -> ForecastConfig {
        ForecastConfig::default()
    }

    fn vector(demand: f64, agents: f64) -> FeatureVector {
        let values = [
            (pool::key("codegen", pool::DEMAND), demand),
            (pool::key("codegen", pool::AGENTS), agents),
            (pool::key("codegen", pool::SLOTS_PER_AGENT), 1.0),
        ]
        .into_iter()
        .collect();
        FeatureVector {
            timestamp: Utc::now(),
            values,
        }
    }

    fn history(demands: &[f64]) -> VecDeque<FeatureVector> {
        demands.iter().map(|d| vector(*d, 4.0)).collect()
    }

    #[test]
    fn test_blend_below_threshold() {
        assert_eq!(blend(10, 20, 0.5, &config()), 13);
    }

    #[test]
    fn test_blend_skipped_when_confident() {
        assert_eq!(blend(10, 20, 0.9, &config()), 10);
    }

    #[test]
    fn test_steady_series_is_confident() {
        let model = HoltModel::new(&config());
        let p = model.predict(&history(&[6.0; 10]), "codegen", 15, 15);
        assert_eq!(p.agents.round(), 6.0);
        assert!(p.confidence > 0.99, "confidence {}", p.confidence);
    }

    #[test]
    fn test_rising_series_projects_upward() {
        let model = HoltModel::new(&config());
        let series: Vec<f64> = (1..=12).map(|n| n as f64).collect();
        let p = model.predict(&history(&series), "codegen", 5, 15);
        assert!(p.agents > 12.0);
        assert!((0.0..=1.0).contains(&p.confidence));
    }

    #[test]
    fn test_short_history_lowers_confidence() {
        let model = HoltModel::new(&config());
        let p = model.predict(&history(&[5.0, 5.0]), "codegen", 1, 15);
        assert!((p.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_longer_horizons_decay_confidence() {
        let model = HoltModel::new(&config());
        let h = history(&[5.0; 10]);
        let c15 = model.predict(&h, "codegen", 15, 15).confidence;
        let c60 = model.predict(&h, "codegen", 60, 60).confidence;
        assert!(c60 < c15);
    }

    #[test]
    fn test_predictions_never_negative() {
        let model = HoltModel::new(&config());
        let series: Vec<f64> = (0..10).map(|n| (20 - 2 * n) as f64).collect();
        let p = model.predict(&history(&series), "codegen", 60, 60);
        assert!(p.agents >= 0.0);
    }

    #[test]
    fn test_rule_estimate_clamps_growth_and_bounds() {
        let mut latest = vector(0.0, 4.0);
        latest.values.insert(features::ARRIVAL_RATE_5M.into(), 10.0);
        latest.values.insert(features::ARRIVAL_RATE_15M.into(), 2.0);
        let constraints = ScalingConstraints::default();

        // growth 5.0 clamps to 2.0
        assert_eq!(rule_estimate(&latest, "codegen", 15, &constraints, &config()), 8);
        assert_eq!(rule_estimate(&latest, "codegen", 60, &constraints, &config()), 20);
    }

    #[test]
    fn test_engine_blends_low_confidence_forecasts() {
        let engine = ForecastEngine::new(Box::new(HoltModel::new(&config())), config(), 60);
        let h = history(&[10.0, 10.0]);
        let forecast = engine.predict(Utc::now(), &h, &[15], |_| ScalingConstraints::default());

        assert!(forecast.blended[&15]);
        // model 10, rule 4 (no arrival data, growth 1) -> 0.7 * 10 + 0.3 * 4 = 8.2
        assert_eq!(forecast.prediction(15, "codegen"), Some(8));
    }

    #[test]
    fn test_engine_with_empty_history() {
        let engine = ForecastEngine::new(Box::new(HoltModel::new(&config())), config(), 60);
        let forecast = engine.predict(Utc::now(), &VecDeque::new(), &[15, 30], |_| {
            ScalingConstraints::default()
        });
        assert_eq!(forecast.confidence_at(30), 0.0);
        assert!(forecast.predictions[&15].is_empty());
    }
}
