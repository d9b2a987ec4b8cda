//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.
//! Feature values and scaling decisions carry the timestamp they were
//! computed at.

use std::fmt::Write;
use std::sync::Arc;

use fleetrun_core::{CircuitState, TaskStatus};

use crate::state::AppState;

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &Arc<AppState>) -> String {
    let mut output = String::new();

    collect_task_metrics(state, &mut output).await;
    collect_queue_metrics(state, &mut output).await;
    collect_agent_metrics(state, &mut output).await;
    collect_feature_metrics(state, &mut output).await;
    collect_scaling_metrics(state, &mut output).await;

    output
}

fn header(output: &mut String, name: &str, kind: &str, help: &str) {
    if !output.is_empty() {
        writeln!(output).ok();
    }
    writeln!(output, "# HELP {name} {help}").ok();
    writeln!(output, "# TYPE {name} {kind}").ok();
}

/// Task counts by status.
async fn collect_task_metrics(state: &Arc<AppState>, output: &mut String) {
    let counts = state.orchestrator.task_counts().await;

    header(output, "fleetrun_tasks", "gauge", "Number of tasks by status");
    for status in TaskStatus::ALL {
        let count = counts.get(&status).copied().unwrap_or(0);
        writeln!(output, "fleetrun_tasks{{status=\"{}\"}} {count}", status.as_label()).ok();
    }

    let dead_letters = state.orchestrator.dead_letters().await.len();
    header(
        output,
        "fleetrun_dead_letters",
        "gauge",
        "Entries in the dead-letter store",
    );
    writeln!(output, "fleetrun_dead_letters {dead_letters}").ok();
}

async fn collect_queue_metrics(state: &Arc<AppState>, output: &mut String) {
    let depths = state.orchestrator.queue_depths().await;
    header(output, "fleetrun_queue_depth", "gauge", "Queued tasks by priority");
    for (priority, depth) in depths {
        writeln!(
            output,
            "fleetrun_queue_depth{{priority=\"{}\"}} {depth}",
            priority.as_label()
        )
        .ok();
    }

    let utilization = state.orchestrator.queue_utilization().await;
    header(
        output,
        "fleetrun_queue_utilization",
        "gauge",
        "Fraction of queue capacity in use",
    );
    writeln!(output, "fleetrun_queue_utilization {utilization}").ok();
}

/// Pool sizes and breaker states.
async fn collect_agent_metrics(state: &Arc<AppState>, output: &mut String) {
    let pools = state.orchestrator.pool_stats().await;

    header(output, "fleetrun_agents", "gauge", "Registered agents by type");
    for (agent_type, stats) in &pools {
        writeln!(output, "fleetrun_agents{{agent_type=\"{agent_type}\"}} {}", stats.agents).ok();
    }

    header(
        output,
        "fleetrun_agent_utilization",
        "gauge",
        "Fraction of concurrency slots in use by agent type",
    );
    for (agent_type, stats) in &pools {
        writeln!(
            output,
            "fleetrun_agent_utilization{{agent_type=\"{agent_type}\"}} {}",
            stats.utilization()
        )
        .ok();
    }

    let agents = state.orchestrator.agents().await;
    let mut closed = 0u64;
    let mut open = 0u64;
    let mut half_open = 0u64;
    for agent in &agents {
        match agent.circuit_state {
            CircuitState::Closed => closed += 1,
            CircuitState::Open => open += 1,
            CircuitState::HalfOpen => half_open += 1,
        }
    }
    header(
        output,
        "fleetrun_agent_circuits",
        "gauge",
        "Agents by circuit breaker state",
    );
    writeln!(output, "fleetrun_agent_circuits{{state=\"closed\"}} {closed}").ok();
    writeln!(output, "fleetrun_agent_circuits{{state=\"open\"}} {open}").ok();
    writeln!(output, "fleetrun_agent_circuits{{state=\"half_open\"}} {half_open}").ok();
}

/// Latest feature vector, one series per feature.
async fn collect_feature_metrics(state: &Arc<AppState>, output: &mut String) {
    let Some(vector) = state.autoscaler.latest_features().await else {
        return;
    };
    let ts = vector.timestamp.timestamp_millis();

    header(output, "fleetrun_feature", "gauge", "Latest sampled feature values");
    for (name, value) in &vector.values {
        writeln!(output, "fleetrun_feature{{name=\"{name}\"}} {value} {ts}").ok();
    }
}

/// Latest forecast and the current scaling target per agent type.
async fn collect_scaling_metrics(state: &Arc<AppState>, output: &mut String) {
    if let Some(forecast) = state.autoscaler.latest_forecast().await {
        let ts = forecast.timestamp.timestamp_millis();
        header(
            output,
            "fleetrun_forecast_agents",
            "gauge",
            "Forecast agents needed by horizon and agent type",
        );
        for (horizon, per_type) in &forecast.predictions {
            for (agent_type, agents) in per_type {
                writeln!(
                    output,
                    "fleetrun_forecast_agents{{horizon_minutes=\"{horizon}\",agent_type=\"{agent_type}\"}} {agents} {ts}"
                )
                .ok();
            }
        }

        header(
            output,
            "fleetrun_forecast_confidence",
            "gauge",
            "Forecast confidence by horizon",
        );
        for (horizon, confidence) in &forecast.confidence {
            writeln!(
                output,
                "fleetrun_forecast_confidence{{horizon_minutes=\"{horizon}\"}} {confidence} {ts}"
            )
            .ok();
        }
    }

    let targets = state.autoscaler.latest_targets().await;
    if targets.is_empty() {
        return;
    }
    header(
        output,
        "fleetrun_scaling_target",
        "gauge",
        "Latest scaling target by agent type",
    );
    for (agent_type, decision) in &targets {
        writeln!(
            output,
            "fleetrun_scaling_target{{agent_type=\"{agent_type}\",reason=\"{}\",advisory=\"{}\"}} {} {}",
            decision.reason.as_label(),
            decision.advisory,
            decision.target_count,
            decision.computed_at.timestamp_millis()
        )
        .ok();
    }
}
