//! Dispatch loop - pairs Ready tasks with agents.
//!
//! Each dispatcher serves one shard of the agent pool. Shards share the
//! priority queue; claims in the store keep any task from being placed twice.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fleetrun_core::{Agent, AgentId, CoreError, Task, TaskStatus};

use crate::orchestrator::Orchestrator;
use crate::selection::{rank, SelectionContext};

/// Claim errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Agent cannot take another task: {0}")]
    AgentUnavailable(AgentId),

    #[error(transparent)]
    Claim(#[from] CoreError),
}

enum Placement {
    Placed(Task),
    /// Another claim won, or the task changed since it was read.
    Lost,
    /// No agent in this shard can take it now.
    Unplaced,
}

/// Dispatcher for one shard.
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    shard: usize,
    shards: usize,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, shard: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            orchestrator,
            shard: shard % shards,
            shards,
        }
    }

    /// Place as many queued tasks as the shard's agents can take.
    ///
    /// Returns the number of tasks placed. Tasks no agent can take stay
    /// queued in their original position.
    pub async fn dispatch_cycle(&self) -> usize {
        let orchestrator = &self.orchestrator;
        let mut placed = 0;
        let mut skip = HashSet::new();

        loop {
            let agents = orchestrator
                .registry()
                .candidates(self.shard, self.shards, orchestrator.now())
                .await;
            if agents.is_empty() {
                break;
            }
            let capabilities: BTreeSet<String> = agents
                .iter()
                .flat_map(|a| a.capabilities.iter().cloned())
                .collect();

            let Some(entry) = orchestrator
                .queue()
                .lock()
                .await
                .dequeue_ready_excluding(&capabilities, &skip)
            else {
                break;
            };

            // Entries for tasks that left Ready in the meantime are dropped.
            let Some(task) = orchestrator
                .store()
                .get(&entry.id)
                .await
                .filter(|t| t.status == TaskStatus::Ready)
            else {
                continue;
            };

            match self.place(&task, &agents).await {
                Placement::Placed(claimed) => {
                    placed += 1;
                    orchestrator.launch(claimed).await;
                }
                Placement::Lost => {
                    skip.insert(entry.id.clone());
                    let still_ready = orchestrator
                        .store()
                        .get(&entry.id)
                        .await
                        .is_some_and(|t| t.status == TaskStatus::Ready);
                    if still_ready {
                        orchestrator.queue().lock().await.restore(entry);
                    }
                }
                Placement::Unplaced => {
                    debug!(task_id = %entry.id, shard = self.shard, "No eligible agent");
                    skip.insert(entry.id.clone());
                    orchestrator.queue().lock().await.restore(entry);
                }
            }
        }
        placed
    }

    async fn place(&self, task: &Task, agents: &[Agent]) -> Placement {
        let orchestrator = &self.orchestrator;
        let dispatch = &orchestrator.config().dispatch;
        let ctx = SelectionContext {
            avg_task_duration_secs: orchestrator
                .registry()
                .avg_duration(&task.task_type)
                .await
                .unwrap_or(dispatch.default_task_duration_secs),
            utilization_penalty: dispatch.utilization_penalty,
        };

        for agent_id in rank(orchestrator.policy(), task, agents, &ctx) {
            match orchestrator.claim(&task.id, task.version, &agent_id).await {
                Ok(claimed) => return Placement::Placed(claimed),
                Err(DispatchError::AgentUnavailable(_)) => continue,
                Err(DispatchError::Claim(e)) => {
                    debug!(task_id = %task.id, error = %e, "Claim rejected");
                    return Placement::Lost;
                }
            }
        }
        Placement::Unplaced
    }

    /// Run dispatch cycles until `shutdown` fires, sleeping for the poll
    /// interval whenever a cycle places nothing.
    pub async fn run(self, shutdown: CancellationToken) {
        let idle = self.orchestrator.config().dispatch.poll_interval();
        info!(shard = self.shard, shards = self.shards, "Dispatcher started");

        while !shutdown.is_cancelled() {
            if self.dispatch_cycle().await > 0 {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }
        info!(shard = self.shard, "Dispatcher stopped");
    }
}
