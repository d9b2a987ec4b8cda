//! Predictive autoscaling: feature sampling, forecasting and scaling decisions.

pub mod features;
pub mod forecast;
pub mod scaling;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use fleetrun_core::ScalingDecision;

use crate::config::{Config, ScalingConfig};
use crate::registry::PoolStats;

pub use features::{FeatureExtractor, FeatureVector, MetricSnapshot};
pub use forecast::{Forecast, ForecastEngine, ForecastModel, HoltModel};
pub use scaling::{PoolState, ScalingEngine};

/// Owns the autoscaling pipeline state. Each stage is driven by its own loop
/// in [`crate::runtime`].
pub struct Autoscaler {
    extractor: Mutex<FeatureExtractor>,
    engine: ForecastEngine,
    scaling: Mutex<ScalingEngine>,
    latest_forecast: RwLock<Option<Forecast>>,
    horizons: Vec<u32>,
    scaling_config: ScalingConfig,
}

impl Autoscaler {
    pub fn new(config: &Config) -> Self {
        let model = Box::new(HoltModel::new(&config.forecast));
        Self::with_model(config, model)
    }

    /// Build with a custom forecast model.
    pub fn with_model(config: &Config, model: Box<dyn ForecastModel>) -> Self {
        Self {
            extractor: Mutex::new(FeatureExtractor::new(config.features.history_len)),
            engine: ForecastEngine::new(
                model,
                config.forecast.clone(),
                config.features.sample_interval_secs,
            ),
            scaling: Mutex::new(ScalingEngine::new(config.scaling.clone())),
            latest_forecast: RwLock::new(None),
            horizons: config.forecast.horizons.clone(),
            scaling_config: config.scaling.clone(),
        }
    }

    /// The horizon binding scaling decisions are made for.
    pub fn primary_horizon(&self) -> u32 {
        self.horizons.first().copied().unwrap_or(15)
    }

    /// Extract and store a feature vector.
    pub async fn sample(&self, snapshot: &MetricSnapshot) -> FeatureVector {
        let vector = self.extractor.lock().await.extract(snapshot);
        debug!(features = vector.values.len(), "Sampled features");
        vector
    }

    pub async fn latest_features(&self) -> Option<FeatureVector> {
        self.extractor.lock().await.latest().cloned()
    }

    /// Most recent feature vectors, newest last.
    pub async fn feature_history(&self, limit: usize) -> Vec<FeatureVector> {
        let extractor = self.extractor.lock().await;
        let history = extractor.history();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Forecast from the current history and remember the result.
    pub async fn forecast(&self, now: DateTime<Utc>) -> Forecast {
        let forecast = {
            let extractor = self.extractor.lock().await;
            self.engine
                .predict(now, extractor.history(), &self.horizons, |t| {
                    self.scaling_config.constraints_for(t)
                })
        };
        *self.latest_forecast.write().await = Some(forecast.clone());
        forecast
    }

    pub async fn latest_forecast(&self) -> Option<Forecast> {
        self.latest_forecast.read().await.clone()
    }

    /// Run one decision cycle against the current pools.
    pub async fn evaluate(
        &self,
        now: DateTime<Utc>,
        pools: &BTreeMap<String, PoolStats>,
    ) -> Vec<ScalingDecision> {
        let forecast = self.forecast(now).await;
        let states = pool_states(pools);
        self.scaling
            .lock()
            .await
            .evaluate(&forecast, &states, self.primary_horizon(), now)
    }

    pub async fn manual(
        &self,
        agent_type: &str,
        current: u32,
        target: u32,
        now: DateTime<Utc>,
    ) -> ScalingDecision {
        self.scaling.lock().await.manual(agent_type, current, target, now)
    }

    pub async fn decisions(&self, limit: usize) -> Vec<ScalingDecision> {
        self.scaling.lock().await.decisions(limit)
    }

    pub async fn latest_targets(&self) -> BTreeMap<String, ScalingDecision> {
        self.scaling.lock().await.latest_targets()
    }
}

fn pool_states(pools: &BTreeMap<String, PoolStats>) -> BTreeMap<String, PoolState> {
    pools
        .iter()
        .map(|(agent_type, stats)| {
            let cost_per_agent = if stats.agents == 0 {
                0.0
            } else {
                stats.hourly_cost / stats.agents as f64
            };
            (
                agent_type.clone(),
                PoolState {
                    agents: stats.agents,
                    cost_per_agent,
                },
            )
        })
        .collect()
}
