//! FleetRun Control Plane Library
//!
//! Dependency-aware task orchestration over a pool of agents, with predictive
//! autoscaling of the pool. The [`Orchestrator`] owns the task lifecycle; the
//! [`Autoscaler`] turns sampled metrics into forecasts and scaling decisions;
//! [`Runtime`] drives both from background loops and [`http`] exposes them.

pub mod autoscale;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod fault;
pub mod graph;
pub mod http;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod selection;
pub mod state;
pub mod store;

pub use autoscale::Autoscaler;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use dispatcher::{DispatchError, Dispatcher};
pub use executor::{AgentError, AgentExecutor, HttpAgentExecutor};
pub use orchestrator::{Orchestrator, SweepReport};
pub use registry::DeregisterReason;
pub use runtime::Runtime;
pub use state::AppState;
