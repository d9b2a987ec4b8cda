//! FleetRun CLI - Command line interface for the FleetRun control plane.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use fleetrun_client::HttpClient;
use fleetrun_core::{
    Agent, AgentSpec, DeadLetterEntry, Priority, ScalingDecision, Task, TaskSpec, TaskStatus,
};

/// FleetRun CLI - Control plane management tool
#[derive(Parser)]
#[command(name = "fleetrun")]
#[command(about = "CLI for the FleetRun control plane", long_about = None)]
struct Cli {
    /// Control plane address
    #[arg(short, long, env = "FLEETRUN_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit tasks from a JSON file, or a single task from flags
    Submit {
        /// JSON file holding a task array or `{"tasks": [...]}`
        #[arg(short, long, conflicts_with = "task_type")]
        file: Option<PathBuf>,

        /// Task type
        #[arg(short = 't', long = "type", required_unless_present = "file")]
        task_type: Option<String>,

        /// Payload JSON
        #[arg(short, long)]
        payload: Option<String>,

        /// Priority tier
        #[arg(long, value_parser = parse_priority)]
        priority: Option<Priority>,

        /// Task this one depends on (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },

    /// Get task status
    Status {
        /// Task ID
        id: String,
    },

    /// List tasks
    List {
        /// Only tasks with this status
        #[arg(short, long, value_parser = parse_status)]
        status: Option<TaskStatus>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Cancel a task and its dependents
    Cancel {
        /// Task ID to cancel
        id: String,
    },

    /// Show the current critical path
    #[command(name = "critical-path")]
    CriticalPath,

    /// List registered agents
    Agents,

    /// Register an agent
    #[command(name = "register-agent")]
    RegisterAgent {
        /// Agent type (pool name)
        #[arg(short = 't', long = "type")]
        agent_type: String,

        #[arg(long)]
        id: Option<String>,

        /// Served task type (repeatable; defaults to the agent type)
        #[arg(short, long = "capability")]
        capabilities: Vec<String>,

        #[arg(long, default_value_t = 4)]
        max_concurrent: u32,

        /// Cost per hour
        #[arg(long, default_value_t = 1.0)]
        cost: f64,

        /// Execution endpoint the control plane drives
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Deregister an agent
    #[command(name = "deregister-agent")]
    DeregisterAgent {
        id: String,

        /// shutdown, unhealthy or completed_elsewhere
        #[arg(long, default_value = "shutdown")]
        reason: String,
    },

    /// List dead-lettered tasks
    #[command(name = "dead-letters")]
    DeadLetters,

    /// Resubmit a dead-lettered task
    Reprocess {
        /// Dead-letter entry ID
        id: String,
    },

    /// Show the latest forecast
    Forecast,

    /// Show recent scaling decisions, or request a manual target
    Scaling {
        /// Agent type for a manual decision
        #[arg(long, requires = "target")]
        agent_type: Option<String>,

        /// Manual target pool size
        #[arg(long, requires = "agent_type")]
        target: Option<u32>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = HttpClient::new(&cli.addr);

    match cli.command {
        Commands::Submit {
            file,
            task_type,
            payload,
            priority,
            depends_on,
        } => {
            let specs = match (file, task_type) {
                (Some(path), _) => read_specs(&path)?,
                (None, Some(task_type)) => {
                    vec![single_spec(task_type, payload, priority, depends_on)?]
                }
                (None, None) => return Err("either --file or --type is required".into()),
            };
            let accepted = client.submit(specs).await?;
            println!("Accepted {} task(s):", accepted.len());
            for task in accepted {
                println!("  {:<36}  {}", task.id, task.status);
            }
        }
        Commands::Status { id } => {
            print_task(&client.task(&id).await?);
        }
        Commands::List { status, limit } => {
            print_tasks(&client.list_tasks(status, limit).await?);
        }
        Commands::Cancel { id } => {
            let task = client.cancel(&id).await?;
            if task.status == TaskStatus::Cancelled {
                println!("Task cancelled:");
            } else {
                println!("Cancellation requested:");
            }
            print_task(&task);
        }
        Commands::CriticalPath => {
            print_json(&client.critical_path().await?)?;
        }
        Commands::Agents => {
            print_agents(&client.agents().await?);
        }
        Commands::RegisterAgent {
            agent_type,
            id,
            capabilities,
            max_concurrent,
            cost,
            endpoint,
        } => {
            let mut spec = AgentSpec::new(agent_type)
                .with_max_concurrent(max_concurrent)
                .with_cost_factor(cost);
            if let Some(id) = id {
                spec = spec.with_id(id);
            }
            for capability in capabilities {
                spec = spec.with_capability(capability);
            }
            if let Some(endpoint) = endpoint {
                spec = spec.with_endpoint(endpoint);
            }
            let agent = client.register_agent(&spec).await?;
            println!("Agent registered: {}", agent.id);
        }
        Commands::DeregisterAgent { id, reason } => {
            let response = client.deregister_agent(&id, &reason).await?;
            println!(
                "Agent {} deregistered; {} task(s) requeued",
                response.agent_id,
                response.requeued.len()
            );
            for task_id in response.requeued {
                println!("  {task_id}");
            }
        }
        Commands::DeadLetters => {
            print_dead_letters(&client.dead_letters().await?);
        }
        Commands::Reprocess { id } => {
            let task = client.reprocess(&id).await?;
            println!("Resubmitted as:");
            print_task(&task);
        }
        Commands::Forecast => {
            print_json(&client.forecast().await?)?;
        }
        Commands::Scaling {
            agent_type,
            target,
            limit,
        } => {
            if let (Some(agent_type), Some(target)) = (agent_type, target) {
                let decision = client.manual_scaling(&agent_type, target).await?;
                print_decisions(&[decision]);
            } else {
                print_decisions(&client.scaling_decisions(limit).await?);
            }
        }
    }

    Ok(())
}

fn parse_priority(s: &str) -> Result<Priority, String> {
    Priority::from_label(s).ok_or_else(|| format!("unknown priority '{s}'"))
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    TaskStatus::from_label(s).ok_or_else(|| format!("unknown status '{s}'"))
}

fn read_specs(path: &PathBuf) -> Result<Vec<TaskSpec>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)?;
    let tasks = match value {
        Value::Object(mut map) => map.remove("tasks").unwrap_or(Value::Null),
        other => other,
    };
    Ok(serde_json::from_value(tasks)?)
}

fn single_spec(
    task_type: String,
    payload: Option<String>,
    priority: Option<Priority>,
    depends_on: Vec<String>,
) -> Result<TaskSpec, Box<dyn std::error::Error>> {
    let mut spec = TaskSpec::new(task_type);
    if let Some(payload) = payload {
        spec = spec.with_payload(serde_json::from_str(&payload)?);
    }
    if let Some(priority) = priority {
        spec = spec.with_priority(priority);
    }
    for dependency in depends_on {
        spec = spec.depends_on(dependency);
    }
    Ok(spec)
}

fn print_task(task: &Task) {
    println!("  ID:         {}", task.id);
    println!("  Type:       {}", task.task_type);
    println!("  Priority:   {}", task.priority.as_label());
    println!("  Status:     {}", task.status);
    println!("  Charged:    {}", task.attempt_count);
    println!("  Created:    {}", format_timestamp(task.created_at));
    if !task.dependencies.is_empty() {
        let deps: Vec<&str> = task.dependencies.iter().map(|d| d.as_str()).collect();
        println!("  Depends on: {}", deps.join(", "));
    }
    if let Some(agent) = &task.assigned_agent_id {
        println!("  Agent:      {agent}");
    }
    if let Some(origin) = &task.derived_from {
        println!("  From DLQ:   {origin}");
    }
    if let Some(error) = &task.error {
        println!("  Error:      {error}");
    }
    if let Some(result) = &task.result {
        println!("  Result:     {result}");
    }

    if !task.attempt_history.is_empty() {
        println!("  History:");
        for attempt in &task.attempt_history {
            println!(
                "    - {} on {}: {}",
                format_timestamp(attempt.timestamp),
                attempt.agent_id,
                attempt.error
            );
        }
    }
}

fn print_tasks(tasks: &[Task]) {
    println!("Tasks ({}):", tasks.len());
    println!(
        "{:<36}  {:<13}  {:<10}  {:<16}  {}",
        "ID", "STATUS", "PRIORITY", "TYPE", "CREATED"
    );
    println!("{}", "-".repeat(100));

    for task in tasks {
        println!(
            "{:<36}  {:<13}  {:<10}  {:<16}  {}",
            task.id,
            task.status,
            task.priority.as_label(),
            task.task_type,
            format_timestamp(task.created_at)
        );
    }
}

fn print_agents(agents: &[Agent]) {
    println!("Agents ({}):", agents.len());
    println!(
        "{:<36}  {:<16}  {:<10}  {:<10}  {}",
        "ID", "TYPE", "TASKS", "CIRCUIT", "CAPABILITIES"
    );
    println!("{}", "-".repeat(100));

    for agent in agents {
        let caps: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
        let tasks = format!("{}/{}", agent.active_tasks.len(), agent.max_concurrent_tasks);
        println!(
            "{:<36}  {:<16}  {:<10}  {:<10}  {}",
            agent.id,
            agent.agent_type,
            tasks,
            agent.circuit_state.as_label(),
            caps.join(", ")
        );
    }
}

fn print_dead_letters(entries: &[DeadLetterEntry]) {
    println!("Dead letters ({}):", entries.len());
    println!("{:<36}  {:<36}  {:<8}  {}", "ID", "TASK", "ATTEMPTS", "REASON");
    println!("{}", "-".repeat(100));

    for entry in entries {
        println!(
            "{:<36}  {:<36}  {:<8}  {}",
            entry.id,
            entry.task_id,
            entry.attempt_history.len(),
            entry.failure_reason
        );
    }
}

fn print_decisions(decisions: &[ScalingDecision]) {
    println!(
        "{:<20}  {:<8}  {:<8}  {:<6}  {:<10}  {:<10}  {}",
        "AGENT TYPE", "CURRENT", "TARGET", "DELTA", "REASON", "CONFIDENCE", "APPLY AT"
    );
    println!("{}", "-".repeat(90));

    for d in decisions {
        let reason = if d.advisory {
            format!("{}*", d.reason.as_label())
        } else {
            d.reason.as_label().to_string()
        };
        println!(
            "{:<20}  {:<8}  {:<8}  {:<+6}  {:<10}  {:<10.2}  {}",
            d.agent_type,
            d.current_count,
            d.target_count,
            d.delta(),
            reason,
            d.confidence,
            format_timestamp(d.apply_at)
        );
    }
}

fn print_json(value: &Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
