//! Background loops: dispatch shards, health sweeps, feature sampling and
//! scaling evaluation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::autoscale::Autoscaler;
use crate::dispatcher::Dispatcher;
use crate::orchestrator::Orchestrator;

/// Handles to the running background loops.
pub struct Runtime {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Spawn every background loop.
    pub fn start(orchestrator: Arc<Orchestrator>, autoscaler: Arc<Autoscaler>) -> Self {
        let shutdown = CancellationToken::new();
        let config = orchestrator.config().clone();
        let mut handles = Vec::new();

        let shards = config.dispatch.shards.max(1);
        for shard in 0..shards {
            let dispatcher = Dispatcher::new(Arc::clone(&orchestrator), shard, shards);
            handles.push(tokio::spawn(dispatcher.run(shutdown.clone())));
        }

        let orch = Arc::clone(&orchestrator);
        handles.push(spawn_every(
            Duration::from_secs(config.health.sweep_interval_secs.max(1)),
            shutdown.clone(),
            move || {
                let orch = Arc::clone(&orch);
                async move {
                    orch.probe_agents().await;
                    orch.sweep().await;
                }
            },
        ));

        let (orch, scaler) = (Arc::clone(&orchestrator), Arc::clone(&autoscaler));
        handles.push(spawn_every(
            Duration::from_secs(config.features.sample_interval_secs.max(1)),
            shutdown.clone(),
            move || {
                let (orch, scaler) = (Arc::clone(&orch), Arc::clone(&scaler));
                async move {
                    scaler.sample(&orch.metric_snapshot()).await;
                }
            },
        ));

        let (orch, scaler) = (Arc::clone(&orchestrator), Arc::clone(&autoscaler));
        handles.push(spawn_every(
            Duration::from_secs(config.scaling.interval_secs.max(1)),
            shutdown.clone(),
            move || {
                let (orch, scaler) = (Arc::clone(&orch), Arc::clone(&scaler));
                async move {
                    let pools = orch.pool_stats().await;
                    scaler.evaluate(orch.now(), &pools).await;
                }
            },
        ));

        info!(dispatch_shards = shards, loops = handles.len(), "Background loops started");
        Self { shutdown, handles }
    }

    /// Token that stops every loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every loop and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("Background loops stopped");
    }
}

/// Run `tick` every `period` until `shutdown` fires. The first run happens
/// one period after start.
fn spawn_every<F, Fut>(period: Duration, shutdown: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => tick().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use fleetrun_core::{AgentSpec, TaskId, TaskSpec, TaskStatus};

    #[tokio::test(start_paused = true)]
    async fn test_runtime_dispatches_and_samples() {
        let mut config = Config::default();
        config.features.sample_interval_secs = 1;
        let orchestrator = Orchestrator::new(config.clone());
        let autoscaler = Arc::new(Autoscaler::new(&config));

        orchestrator
            .register_agent(AgentSpec::new("build").with_id("a1"))
            .await
            .unwrap();
        orchestrator
            .submit(vec![TaskSpec::new("build").with_id("t1")])
            .await
            .unwrap();

        let runtime = Runtime::start(Arc::clone(&orchestrator), Arc::clone(&autoscaler));
        tokio::time::sleep(Duration::from_secs(3)).await;
        runtime.shutdown().await;

        let task = orchestrator.task(&TaskId::new("t1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert!(!autoscaler.feature_history(10).await.is_empty());
    }
}
