//! FleetRun Control Plane Server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleetrun_control_plane::{http, AppState, Config, Runtime};

/// FleetRun orchestrator: dependency-aware dispatch and predictive autoscaling.
#[derive(Parser, Debug)]
#[command(name = "fleetrun-control-plane", about = "FleetRun control plane server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, env = "FLEETRUN_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetrun=info")),
        )
        .with_target(true)
        .init();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    config.validate()?;
    let http_addr: SocketAddr = config.server.bind_addr.parse()?;

    // Create shared state
    let state = AppState::new(config.clone());
    for spec in config.agents.clone() {
        let agent = state.orchestrator.register_agent(spec).await?;
        info!(agent_id = %agent.id, "Configured agent registered");
    }

    let runtime = Runtime::start(
        Arc::clone(&state.orchestrator),
        Arc::clone(&state.autoscaler),
    );
    let shutdown = runtime.shutdown_token();

    // Start HTTP server
    let router = http::create_router(Arc::clone(&state));
    let listener = TcpListener::bind(http_addr).await?;
    info!(http_addr = %http_addr, "Starting FleetRun control plane");

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
            _ = shutdown.cancelled() => {}
        }
    });
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server error");
    }

    runtime.shutdown().await;
    info!("FleetRun control plane stopped");
    Ok(())
}
