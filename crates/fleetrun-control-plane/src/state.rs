//! Shared application state.

use std::sync::Arc;

use crate::autoscale::Autoscaler;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::orchestrator::Orchestrator;

/// Shared application state handed to HTTP handlers and background loops.
pub struct AppState {
    /// Task lifecycle, agent registry and dispatch.
    pub orchestrator: Arc<Orchestrator>,

    /// Feature history, forecasts and scaling decisions.
    pub autoscaler: Arc<Autoscaler>,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a new AppState driven by `clock`.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Arc<Self> {
        let autoscaler = Arc::new(Autoscaler::new(&config));
        Arc::new(Self {
            orchestrator: Orchestrator::with_clock(config, clock),
            autoscaler,
        })
    }

    pub fn config(&self) -> &Config {
        self.orchestrator.config()
    }
}
