//! HTTP request handlers.

mod agents;
mod autoscale;
mod dead_letters;
mod health;
mod tasks;

pub use agents::{agent_heartbeat, deregister_agent, get_agent, list_agents, register_agent};
pub use autoscale::{features, forecast, manual_scaling, scaling_decisions};
pub use dead_letters::{get_dead_letter, list_dead_letters, reprocess_dead_letter};
pub use health::{health_check, metrics_handler};
pub use tasks::{
    cancel_task, complete_task, critical_path, fail_task, get_task, list_tasks, submit_tasks,
};
