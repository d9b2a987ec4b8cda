//! Task lifecycle coordination.
//!
//! The [`Orchestrator`] owns the task store, dependency graph, priority queue
//! and agent registry, and moves tasks through their lifecycle in response to
//! submissions, claims, agent reports, cancellations and sweeps.
//!
//! Locks held across awaits are always taken in the order graph, queue,
//! leases. The store and registry guard their own state and never call back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleetrun_core::{
    Agent, AgentId, AgentSpec, CompletionReport, CoreError, DeadLetterEntry, DeadLetterId,
    FailureReport, Priority, Task, TaskAccepted, TaskFailure, TaskId, TaskSpec, TaskStatus,
};

use crate::autoscale::features::{ActivityRecorder, MetricSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dispatcher::DispatchError;
use crate::executor::{AgentError, AgentExecutor, HttpAgentExecutor};
use crate::fault::{BreakerSettings, FailureOutcome, FaultHandler};
use crate::graph::{CriticalPath, DependencyGraph};
use crate::queue::PriorityQueue;
use crate::registry::{AgentRegistry, DeregisterReason, PoolStats};
use crate::selection::{policy_from_config, SelectionPolicy};
use crate::store::{DeadLetterStore, TaskStore};

const CANCELLED_BY_REQUEST: &str = "cancelled by request";

/// An agent's hold on a claimed task.
#[derive(Debug, Clone)]
struct Lease {
    agent_id: AgentId,
    claim_version: u64,
    deadline: DateTime<Utc>,
    explicit_deadline: bool,
    cancel: CancellationToken,
    cancel_requested_at: Option<DateTime<Utc>>,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Tasks failed for running past their deadline.
    pub timed_out: Vec<TaskId>,
    /// Cancelled tasks whose agent never acknowledged within the grace period.
    pub forced_failures: Vec<TaskId>,
    /// Agents removed for missing heartbeats.
    pub deregistered: Vec<AgentId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.forced_failures.is_empty() && self.deregistered.is_empty()
    }
}

pub struct Orchestrator {
    config: Config,
    clock: Arc<dyn Clock>,
    store: TaskStore,
    dead_letters: DeadLetterStore,
    graph: Mutex<DependencyGraph>,
    queue: Mutex<PriorityQueue>,
    leases: Mutex<HashMap<TaskId, Lease>>,
    registry: AgentRegistry,
    policy: Box<dyn SelectionPolicy>,
    faults: FaultHandler,
    activity: ActivityRecorder,
}

impl Orchestrator {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Arc<Self> {
        let policy = policy_from_config(&config.dispatch);
        Self::with_parts(config, clock, policy)
    }

    /// Build with an explicit clock and selection policy.
    pub fn with_parts(
        config: Config,
        clock: Arc<dyn Clock>,
        policy: Box<dyn SelectionPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: TaskStore::new(),
            dead_letters: DeadLetterStore::new(),
            graph: Mutex::new(DependencyGraph::new()),
            queue: Mutex::new(PriorityQueue::new(
                config.queue.capacity,
                config.queue.shed_threshold,
            )),
            leases: Mutex::new(HashMap::new()),
            registry: AgentRegistry::new(BreakerSettings::from(&config.fault)),
            faults: FaultHandler::new(&config.fault),
            activity: ActivityRecorder::new(),
            policy,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub(crate) fn queue(&self) -> &Mutex<PriorityQueue> {
        &self.queue
    }

    pub(crate) fn store(&self) -> &TaskStore {
        &self.store
    }

    pub(crate) fn policy(&self) -> &dyn SelectionPolicy {
        self.policy.as_ref()
    }

    // ---------------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------------

    /// Submit a batch of tasks atomically.
    ///
    /// Either every task is accepted or none is. Tasks with no outstanding
    /// dependencies are queued as Ready; the rest wait as Pending. A task that
    /// depends on one that can no longer complete is accepted as Cancelled.
    pub async fn submit(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskAccepted>, CoreError> {
        if specs.is_empty() {
            return Err(CoreError::InvalidInput("batch contains no tasks".into()));
        }
        for spec in &specs {
            spec.validate()?;
        }
        let now = self.clock.now();
        let tasks = specs.into_iter().map(|s| s.into_task(now)).collect();
        let stored = self.admit(tasks).await?;
        Ok(stored
            .iter()
            .map(|t| TaskAccepted {
                id: t.id.clone(),
                status: t.status,
            })
            .collect())
    }

    async fn admit(&self, mut tasks: Vec<Task>) -> Result<Vec<Task>, CoreError> {
        let now = self.clock.now();
        let mut graph = self.graph.lock().await;
        graph.validate_batch(&tasks)?;

        let batch_ids: HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        let external: Vec<TaskId> = tasks
            .iter()
            .flat_map(|t| t.dependencies.iter())
            .filter(|d| !batch_ids.contains(*d))
            .cloned()
            .collect();
        let statuses = self.store.statuses(external.iter()).await;
        resolve_initial_statuses(&mut tasks, &statuses, now)?;

        let mut queue = self.queue.lock().await;
        {
            let ready: Vec<&Task> = tasks.iter().filter(|t| t.status == TaskStatus::Ready).collect();
            if let Err(e) = queue.enqueue_batch(&ready) {
                warn!(batch = tasks.len(), ready = ready.len(), error = %e, "Submission shed");
                return Err(e.into());
            }
        }
        let ready_ids: Vec<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .map(|t| t.id.clone())
            .collect();

        let stored = match self.store.insert_batch(tasks).await {
            Ok(stored) => stored,
            Err(e) => {
                for id in &ready_ids {
                    queue.remove(id);
                }
                return Err(e);
            }
        };
        graph.insert_batch(&stored);
        drop(queue);
        drop(graph);

        self.activity.record_submission(&stored, now);
        info!(
            tasks = stored.len(),
            ready = ready_ids.len(),
            "Batch accepted"
        );
        Ok(stored)
    }

    /// Resubmit a dead-lettered task as a new task. The entry is kept.
    pub async fn reprocess(&self, id: &DeadLetterId) -> Result<Task, CoreError> {
        let entry = self
            .dead_letters
            .get(id)
            .await
            .ok_or_else(|| CoreError::DeadLetterNotFound(id.clone()))?;

        let mut task = entry.to_spec().into_task(self.clock.now());
        task.derived_from = Some(entry.id.clone());
        let mut stored = self.admit(vec![task]).await?;
        let task = stored
            .pop()
            .ok_or_else(|| CoreError::InvalidInput("reprocessed batch was empty".into()))?;

        info!(dead_letter_id = %id, task_id = %task.id, "Dead letter reprocessed");
        Ok(task)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub async fn task(&self, id: &TaskId) -> Result<Task, CoreError> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| CoreError::TaskNotFound(id.clone()))
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Vec<Task> {
        self.store.list(status, limit).await
    }

    pub async fn task_counts(&self) -> BTreeMap<TaskStatus, usize> {
        self.store.count_by_status().await
    }

    pub async fn queue_depths(&self) -> Vec<(Priority, usize)> {
        self.queue.lock().await.depth_by_priority()
    }

    pub async fn queue_utilization(&self) -> f64 {
        self.queue.lock().await.utilization()
    }

    pub async fn agents(&self) -> Vec<Agent> {
        self.registry.list().await
    }

    pub async fn agent(&self, id: &AgentId) -> Result<Agent, CoreError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| CoreError::AgentNotFound(id.clone()))
    }

    pub async fn pool_stats(&self) -> BTreeMap<String, PoolStats> {
        self.registry.pool_stats().await
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.list().await
    }

    pub async fn dead_letter(&self, id: &DeadLetterId) -> Result<DeadLetterEntry, CoreError> {
        self.dead_letters
            .get(id)
            .await
            .ok_or_else(|| CoreError::DeadLetterNotFound(id.clone()))
    }

    /// Longest chain of unfinished tasks, weighted by estimated complexity
    /// times the average duration observed for each task type.
    pub async fn critical_path(&self) -> CriticalPath {
        let statuses = self.store.status_map().await;
        let durations = self.registry.avg_durations().await;
        let default_secs = self.config.dispatch.default_task_duration_secs;

        let graph = self.graph.lock().await;
        graph.critical_path(|id, task_type, complexity| {
            let status = statuses.get(id)?;
            if status.is_terminal() || status.blocks_dependents() {
                return None;
            }
            let secs = durations.get(task_type).copied().unwrap_or(default_secs);
            Some(complexity * secs)
        })
    }

    /// Point-in-time metrics for the feature extractor.
    ///
    /// Never blocks: sources that are busy are left out and the extractor
    /// falls back to their last known values.
    pub fn metric_snapshot(&self) -> MetricSnapshot {
        let now = self.clock.now();
        let (queue_depths, queued_by_type) = match self.queue.try_lock() {
            Ok(queue) => (Some(queue.depth_by_priority()), Some(queue.depth_by_type())),
            Err(_) => (None, None),
        };
        MetricSnapshot {
            timestamp: now,
            arrivals: Some(self.activity.arrivals(now)),
            queue_depths,
            queued_by_type,
            pools: self.registry.try_pool_stats(),
            complexity: self.activity.complexity(),
            dependency_ratio: self.activity.dependency_ratio(),
        }
    }

    // ---------------------------------------------------------------------
    // Agents
    // ---------------------------------------------------------------------

    /// Register an agent. Agents with an endpoint are driven over HTTP;
    /// agents without one report results through the API.
    pub async fn register_agent(&self, spec: AgentSpec) -> Result<Agent, CoreError> {
        let executor = spec
            .endpoint
            .as_deref()
            .map(|endpoint| Arc::new(HttpAgentExecutor::new(endpoint)) as Arc<dyn AgentExecutor>);
        self.registry.register(spec, executor, self.clock.now()).await
    }

    pub async fn register_agent_with_executor(
        &self,
        spec: AgentSpec,
        executor: Arc<dyn AgentExecutor>,
    ) -> Result<Agent, CoreError> {
        self.registry
            .register(spec, Some(executor), self.clock.now())
            .await
    }

    pub async fn heartbeat(&self, id: &AgentId) -> Result<Agent, CoreError> {
        self.registry.heartbeat(id, self.clock.now()).await
    }

    /// Probe every agent with an executor and record a heartbeat for those
    /// that answer.
    pub async fn probe_agents(&self) {
        for (id, executor) in self.registry.executors().await {
            if executor.heartbeat().await {
                // The agent may have been removed while the probe was in flight.
                let _ = self.registry.heartbeat(&id, self.clock.now()).await;
            } else {
                debug!(agent_id = %id, "Health probe failed");
            }
        }
    }

    /// Remove an agent. Unless it finished its work elsewhere, the tasks it
    /// held go back to the queue without charging an attempt.
    pub async fn deregister_agent(
        &self,
        id: &AgentId,
        reason: DeregisterReason,
    ) -> Result<Vec<TaskId>, CoreError> {
        let held = self.registry.deregister(id, reason).await?;
        if !reason.requeues_tasks() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut requeued = Vec::new();
        for task_id in held {
            let mut leases = self.leases.lock().await;
            let lease = match leases.get(&task_id) {
                Some(l) if &l.agent_id == id => l.clone(),
                _ => continue,
            };

            let cancel_requested = lease.cancel_requested_at.is_some();
            let result = self
                .store
                .update_if(&task_id, &[TaskStatus::Assigned, TaskStatus::Running], |t| {
                    check_claim(t, lease.claim_version)?;
                    if cancel_requested {
                        t.transition(TaskStatus::Cancelled)?;
                        t.finished_at = Some(now);
                        t.error = Some(CANCELLED_BY_REQUEST.into());
                        Ok(())
                    } else {
                        release_claim(t)
                    }
                })
                .await;
            leases.remove(&task_id);
            drop(leases);
            lease.cancel.cancel();

            match result {
                Ok(task) if task.status == TaskStatus::Ready => {
                    self.queue.lock().await.requeue(&task);
                    info!(task_id = %task.id, agent_id = %id, "Task requeued after agent loss");
                    requeued.push(task.id);
                }
                Ok(task) => {
                    info!(task_id = %task.id, "Task cancelled");
                    self.resolve_dependents(&task.id, TaskStatus::Cancelled).await;
                }
                Err(e) => debug!(task_id = %task_id, error = %e, "Held task already settled"),
            }
        }
        Ok(requeued)
    }

    // ---------------------------------------------------------------------
    // Claims and execution
    // ---------------------------------------------------------------------

    /// Claim a Ready task observed at `observed_version` for `agent_id`.
    ///
    /// Of any number of concurrent claims on the same observation exactly
    /// one succeeds. The agent's slot is reserved first and released again
    /// if the claim loses.
    pub async fn claim(
        &self,
        task_id: &TaskId,
        observed_version: u64,
        agent_id: &AgentId,
    ) -> Result<Task, DispatchError> {
        let now = self.clock.now();
        if !self.registry.try_reserve(agent_id, task_id, now).await {
            return Err(DispatchError::AgentUnavailable(agent_id.clone()));
        }

        let mut leases = self.leases.lock().await;
        match self.store.claim(task_id, observed_version, agent_id).await {
            Ok(task) => {
                let claim_version = task.claim_version.unwrap_or(task.version);
                // A deregistration that ran between the reservation and the
                // claim could not see this task's lease; hand it back here.
                if !self.registry.contains(agent_id).await {
                    let reverted = self
                        .store
                        .update_if(task_id, &[TaskStatus::Assigned], |t| {
                            check_claim(t, claim_version)?;
                            release_claim(t)
                        })
                        .await;
                    drop(leases);
                    if let Ok(task) = reverted {
                        self.queue.lock().await.requeue(&task);
                    }
                    debug!(task_id = %task_id, agent_id = %agent_id, "Agent left during claim");
                    return Err(DispatchError::AgentUnavailable(agent_id.clone()));
                }
                leases.insert(
                    task_id.clone(),
                    Lease {
                        agent_id: agent_id.clone(),
                        claim_version,
                        deadline: self.deadline_for(&task, now),
                        explicit_deadline: task.deadline.is_some(),
                        cancel: CancellationToken::new(),
                        cancel_requested_at: None,
                    },
                );
                info!(
                    task_id = %task_id,
                    agent_id = %agent_id,
                    claim_version,
                    "Task assigned"
                );
                Ok(task)
            }
            Err(e) => {
                drop(leases);
                self.registry.release(agent_id, task_id).await;
                debug!(task_id = %task_id, agent_id = %agent_id, error = %e, "Claim lost");
                Err(DispatchError::Claim(e))
            }
        }
    }

    fn deadline_for(&self, task: &Task, from: DateTime<Utc>) -> DateTime<Utc> {
        task.deadline
            .unwrap_or_else(|| from + self.config.dispatch.sla_for(&task.task_type))
    }

    /// Start executing a claimed task on its agent's executor.
    ///
    /// Agents without an executor pick the work up themselves and report
    /// through the API; nothing is started for them here.
    pub async fn launch(self: &Arc<Self>, task: Task) {
        let (Some(agent_id), Some(claim_version)) =
            (task.assigned_agent_id.clone(), task.claim_version)
        else {
            return;
        };
        let Some(executor) = self.registry.executor(&agent_id).await else {
            debug!(task_id = %task.id, agent_id = %agent_id, "Awaiting external report");
            return;
        };

        let (running, cancel) = match self.mark_running(&task.id, claim_version).await {
            Ok(started) => started,
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "Task settled before launch");
                return;
            }
        };

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let result = executor.execute(&running, cancel).await;
            orchestrator
                .settle_execution(&running.id, agent_id, claim_version, result)
                .await;
        });
    }

    async fn mark_running(
        &self,
        id: &TaskId,
        claim_version: u64,
    ) -> Result<(Task, CancellationToken), CoreError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().await;
        let lease = leases
            .get_mut(id)
            .filter(|l| l.claim_version == claim_version)
            .ok_or_else(|| stale_claim(id, claim_version, None))?;

        let task = self
            .store
            .update_if(id, &[TaskStatus::Assigned], |t| {
                check_claim(t, claim_version)?;
                t.transition(TaskStatus::Running)?;
                t.started_at = Some(now);
                Ok(())
            })
            .await?;
        if !lease.explicit_deadline {
            lease.deadline = now + self.config.dispatch.sla_for(&task.task_type);
        }
        debug!(task_id = %id, agent_id = %lease.agent_id, "Task running");
        Ok((task, lease.cancel.clone()))
    }

    async fn settle_execution(
        &self,
        id: &TaskId,
        agent_id: AgentId,
        claim_version: u64,
        result: Result<Value, AgentError>,
    ) {
        let settled = match result {
            Ok(value) => self
                .complete(
                    id,
                    CompletionReport {
                        agent_id,
                        claim_version: Some(claim_version),
                        result: value,
                    },
                )
                .await,
            Err(err) => {
                let failure = err
                    .into_failure()
                    .unwrap_or_else(|| TaskFailure::transient("execution cancelled by agent"));
                self.fail(
                    id,
                    FailureReport {
                        agent_id,
                        claim_version: Some(claim_version),
                        failure,
                    },
                )
                .await
            }
        };
        if let Err(e) = settled {
            debug!(task_id = %id, error = %e, "Execution report discarded");
        }
    }

    // ---------------------------------------------------------------------
    // Reports
    // ---------------------------------------------------------------------

    /// Record a successful execution.
    ///
    /// The report must come from the agent holding the current claim. A
    /// report for a task whose cancellation was requested finishes it as
    /// Cancelled instead.
    pub async fn complete(&self, id: &TaskId, report: CompletionReport) -> Result<Task, CoreError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().await;
        let lease = current_lease(&leases, id, &report.agent_id, report.claim_version)?;
        if lease.cancel_requested_at.is_some() {
            return self.finish_cancelled(id, &lease, leases, now).await;
        }

        let result = report.result;
        let task = self
            .store
            .update_if(id, &[TaskStatus::Assigned, TaskStatus::Running], |t| {
                check_claim(t, lease.claim_version)?;
                if t.status == TaskStatus::Assigned {
                    t.transition(TaskStatus::Running)?;
                    t.started_at = Some(now);
                }
                t.transition(TaskStatus::Completed)?;
                t.finished_at = Some(now);
                t.result = Some(result);
                t.error = None;
                Ok(())
            })
            .await?;
        leases.remove(id);
        drop(leases);

        let duration_secs = task
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
        self.registry
            .record_success(&lease.agent_id, id, &task.task_type, duration_secs, now)
            .await;
        info!(
            task_id = %id,
            agent_id = %lease.agent_id,
            duration_secs = duration_secs.unwrap_or_default(),
            "Task completed"
        );

        self.resolve_dependents(id, TaskStatus::Completed).await;
        Ok(task)
    }

    /// Record a failed execution and apply the retry policy.
    ///
    /// Infrastructure failures requeue without charging an attempt. Other
    /// retryable failures charge an attempt and requeue until the attempt
    /// budget runs out, then dead-letter the task.
    pub async fn fail(&self, id: &TaskId, report: FailureReport) -> Result<Task, CoreError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().await;
        let lease = current_lease(&leases, id, &report.agent_id, report.claim_version)?;
        if lease.cancel_requested_at.is_some() {
            return self.finish_cancelled(id, &lease, leases, now).await;
        }

        let failure = report.failure;
        let task = self
            .store
            .update_if(id, &[TaskStatus::Assigned, TaskStatus::Running], |t| {
                check_claim(t, lease.claim_version)?;
                let outcome = self.faults.decide(t, &failure);
                t.record_attempt(lease.agent_id.clone(), failure.to_string(), now);
                t.error = Some(failure.to_string());

                if outcome.charges_attempt() {
                    t.transition(TaskStatus::Failed)?;
                    t.attempt_count += 1;
                }
                match outcome {
                    FailureOutcome::Requeue | FailureOutcome::Retry => release_claim(t),
                    FailureOutcome::DeadLetter { reason } => {
                        t.transition(TaskStatus::DeadLettered)?;
                        t.finished_at = Some(now);
                        t.error = Some(reason);
                        Ok(())
                    }
                }
            })
            .await?;
        leases.remove(id);
        drop(leases);
        lease.cancel.cancel();

        self.registry
            .record_failure(
                &lease.agent_id,
                id,
                FaultHandler::counts_against_agent(failure.kind),
                now,
            )
            .await;

        match task.status {
            TaskStatus::Ready => {
                warn!(
                    task_id = %id,
                    agent_id = %lease.agent_id,
                    kind = %failure.kind,
                    attempts = task.attempt_count,
                    "Task failed; requeued"
                );
                self.queue.lock().await.requeue(&task);
            }
            TaskStatus::DeadLettered => {
                let reason = task.error.clone().unwrap_or_else(|| failure.to_string());
                let entry = DeadLetterEntry::from_task(&task, reason, now);
                error!(
                    task_id = %id,
                    dead_letter_id = %entry.id,
                    attempts = task.attempt_count,
                    reason = %entry.failure_reason,
                    "Task dead-lettered"
                );
                self.dead_letters.append(entry).await;
                self.resolve_dependents(id, TaskStatus::DeadLettered).await;
            }
            _ => {}
        }
        Ok(task)
    }

    async fn finish_cancelled(
        &self,
        id: &TaskId,
        lease: &Lease,
        mut leases: tokio::sync::MutexGuard<'_, HashMap<TaskId, Lease>>,
        now: DateTime<Utc>,
    ) -> Result<Task, CoreError> {
        let task = self
            .store
            .update_if(id, &[TaskStatus::Assigned, TaskStatus::Running], |t| {
                check_claim(t, lease.claim_version)?;
                t.transition(TaskStatus::Cancelled)?;
                t.finished_at = Some(now);
                t.error = Some(CANCELLED_BY_REQUEST.into());
                Ok(())
            })
            .await?;
        leases.remove(id);
        drop(leases);

        self.registry.release(&lease.agent_id, id).await;
        info!(task_id = %id, agent_id = %lease.agent_id, "Task cancelled");
        self.resolve_dependents(id, TaskStatus::Cancelled).await;
        Ok(task)
    }

    // ---------------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------------

    /// Cancel a task.
    ///
    /// Unclaimed tasks are cancelled immediately. For claimed tasks the
    /// agent is signalled and the task is cancelled once it acknowledges, or
    /// failed if it does not within the grace period.
    pub async fn cancel(&self, id: &TaskId) -> Result<Task, CoreError> {
        const ATTEMPTS: usize = 4;
        let mut last = None;
        for _ in 0..ATTEMPTS {
            let task = self.task(id).await?;
            let result = match task.status {
                TaskStatus::Pending | TaskStatus::Ready => self.cancel_unclaimed(id).await,
                status if status.is_claimed() => self.request_cancel(&task).await,
                from => {
                    return Err(CoreError::InvalidStateTransition {
                        from,
                        to: TaskStatus::Cancelled,
                    })
                }
            };
            match result {
                Err(e @ CoreError::StalePrecondition { .. }) => last = Some(e),
                other => return other,
            }
        }
        Err(last.unwrap_or_else(|| CoreError::TaskNotFound(id.clone())))
    }

    async fn cancel_unclaimed(&self, id: &TaskId) -> Result<Task, CoreError> {
        let now = self.clock.now();
        let task = {
            let mut queue = self.queue.lock().await;
            let task = self
                .store
                .update_if(id, &[TaskStatus::Pending, TaskStatus::Ready], |t| {
                    t.transition(TaskStatus::Cancelled)?;
                    t.finished_at = Some(now);
                    t.error = Some(CANCELLED_BY_REQUEST.into());
                    Ok(())
                })
                .await?;
            queue.remove(id);
            task
        };
        info!(task_id = %id, "Task cancelled");
        self.resolve_dependents(id, TaskStatus::Cancelled).await;
        Ok(task)
    }

    async fn request_cancel(&self, task: &Task) -> Result<Task, CoreError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().await;
        let lease = leases
            .get_mut(&task.id)
            .filter(|l| Some(l.claim_version) == task.claim_version)
            .ok_or_else(|| stale_claim(&task.id, task.claim_version.unwrap_or_default(), None))?;

        if lease.cancel_requested_at.is_none() {
            lease.cancel_requested_at = Some(now);
            lease.cancel.cancel();
            info!(task_id = %task.id, agent_id = %lease.agent_id, "Cancellation requested");
        }
        Ok(task.clone())
    }

    // ---------------------------------------------------------------------
    // Sweeps
    // ---------------------------------------------------------------------

    /// Enforce deadlines, cancellation grace periods and agent liveness.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let grace = Duration::seconds(self.config.dispatch.cancel_grace_secs as i64);
        let mut report = SweepReport::default();

        let expired: Vec<(TaskId, Lease)> = self
            .leases
            .lock()
            .await
            .iter()
            .filter(|(_, lease)| match lease.cancel_requested_at {
                Some(requested) => now >= requested + grace,
                None => now > lease.deadline,
            })
            .map(|(id, lease)| (id.clone(), lease.clone()))
            .collect();

        for (id, lease) in expired {
            if lease.cancel_requested_at.is_some() {
                match self.force_fail(&id, &lease, now).await {
                    Ok(_) => report.forced_failures.push(id),
                    Err(e) => debug!(task_id = %id, error = %e, "Cancelled task already settled"),
                }
                continue;
            }

            let failure = TaskFailure::timeout(format!("deadline {} exceeded", lease.deadline));
            let timed_out = self
                .fail(
                    &id,
                    FailureReport {
                        agent_id: lease.agent_id.clone(),
                        claim_version: Some(lease.claim_version),
                        failure,
                    },
                )
                .await;
            match timed_out {
                Ok(_) => {
                    warn!(task_id = %id, agent_id = %lease.agent_id, "Task timed out");
                    report.timed_out.push(id);
                }
                Err(e) => debug!(task_id = %id, error = %e, "Timed out task already settled"),
            }
        }

        let interval = Duration::seconds(self.config.health.heartbeat_interval_secs as i64);
        let unhealthy = self
            .registry
            .unhealthy(now, interval, self.config.health.max_missed_heartbeats)
            .await;
        for agent_id in unhealthy {
            warn!(agent_id = %agent_id, "Agent missed heartbeats");
            match self.deregister_agent(&agent_id, DeregisterReason::Unhealthy).await {
                Ok(_) => report.deregistered.push(agent_id),
                Err(e) => debug!(agent_id = %agent_id, error = %e, "Agent already removed"),
            }
        }

        if !report.is_empty() {
            info!(
                timed_out = report.timed_out.len(),
                forced_failures = report.forced_failures.len(),
                deregistered = report.deregistered.len(),
                "Sweep finished"
            );
        }
        report
    }

    /// Fail a task whose agent ignored a cancellation. No retry.
    async fn force_fail(&self, id: &TaskId, seen: &Lease, now: DateTime<Utc>) -> Result<Task, CoreError> {
        let mut leases = self.leases.lock().await;
        let lease = leases
            .get(id)
            .filter(|l| l.claim_version == seen.claim_version)
            .cloned()
            .ok_or_else(|| stale_claim(id, seen.claim_version, None))?;

        let task = self
            .store
            .update_if(id, &[TaskStatus::Assigned, TaskStatus::Running], |t| {
                check_claim(t, lease.claim_version)?;
                t.transition(TaskStatus::Failed)?;
                t.finished_at = Some(now);
                t.error = Some("cancellation not acknowledged within grace period".into());
                Ok(())
            })
            .await?;
        leases.remove(id);
        drop(leases);

        self.registry.release(&lease.agent_id, id).await;
        warn!(task_id = %id, agent_id = %lease.agent_id, "Cancellation unacknowledged; task failed");
        self.resolve_dependents(id, TaskStatus::Failed).await;
        Ok(task)
    }

    // ---------------------------------------------------------------------
    // Dependency resolution
    // ---------------------------------------------------------------------

    /// Propagate a final status to the task's dependents.
    ///
    /// A completion readies dependents whose dependencies have all completed.
    /// Any status that blocks dependents cancels Pending dependents, and that
    /// cancellation propagates in turn.
    async fn resolve_dependents(&self, id: &TaskId, status: TaskStatus) {
        let mut work = vec![(id.clone(), status)];
        while let Some((parent, parent_status)) = work.pop() {
            let dependents = self.graph.lock().await.dependents(&parent);
            for dependent in dependents {
                if parent_status == TaskStatus::Completed {
                    self.ready_if_resolved(&dependent).await;
                } else if parent_status.blocks_dependents() {
                    let now = self.clock.now();
                    let reason = format!("dependency {parent} {parent_status}");
                    let cancelled = self
                        .store
                        .update_if(&dependent, &[TaskStatus::Pending], |t| {
                            t.transition(TaskStatus::Cancelled)?;
                            t.finished_at = Some(now);
                            t.error = Some(reason);
                            Ok(())
                        })
                        .await;
                    if cancelled.is_ok() {
                        info!(task_id = %dependent, dependency = %parent, "Dependent cancelled");
                        work.push((dependent, TaskStatus::Cancelled));
                    }
                }
            }
        }
    }

    async fn ready_if_resolved(&self, id: &TaskId) {
        let Some(task) = self.store.get(id).await else {
            return;
        };
        if task.status != TaskStatus::Pending {
            return;
        }
        let statuses = self.store.statuses(task.dependencies.iter()).await;
        let resolved = task
            .dependencies
            .iter()
            .all(|d| statuses.get(d) == Some(&TaskStatus::Completed));
        if !resolved {
            return;
        }

        let mut queue = self.queue.lock().await;
        // Lost races mean another completion already readied it.
        if let Ok(ready) = self
            .store
            .update_if(id, &[TaskStatus::Pending], |t| t.transition(TaskStatus::Ready))
            .await
        {
            queue.requeue(&ready);
            debug!(task_id = %id, "Task ready");
        }
    }
}

/// Set the starting status of each task in a batch from the statuses of its
/// dependencies outside the batch. Blocked dependencies cancel a task, and
/// that cancellation carries through dependencies inside the batch.
fn resolve_initial_statuses(
    tasks: &mut [Task],
    external: &HashMap<TaskId, TaskStatus>,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    let mut blocked: HashMap<TaskId, String> = HashMap::new();
    loop {
        let mut changed = false;
        for task in tasks.iter() {
            if blocked.contains_key(&task.id) {
                continue;
            }
            let blocker = task.dependencies.iter().find_map(|d| match external.get(d) {
                Some(status) if status.blocks_dependents() => Some(format!("dependency {d} {status}")),
                _ if blocked.contains_key(d) => Some(format!("dependency {d} cancelled")),
                _ => None,
            });
            if let Some(reason) = blocker {
                blocked.insert(task.id.clone(), reason);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for task in tasks.iter_mut() {
        if let Some(reason) = blocked.remove(&task.id) {
            task.transition(TaskStatus::Cancelled)?;
            task.finished_at = Some(now);
            task.error = Some(reason);
        } else if task
            .dependencies
            .iter()
            .all(|d| external.get(d) == Some(&TaskStatus::Completed))
        {
            task.transition(TaskStatus::Ready)?;
        }
    }
    Ok(())
}

fn current_lease(
    leases: &HashMap<TaskId, Lease>,
    id: &TaskId,
    agent_id: &AgentId,
    claim_version: Option<u64>,
) -> Result<Lease, CoreError> {
    let lease = leases
        .get(id)
        .ok_or_else(|| stale_claim(id, claim_version.unwrap_or_default(), None))?;
    if &lease.agent_id != agent_id {
        return Err(CoreError::StalePrecondition {
            task: id.clone(),
            expected: format!("held by {agent_id}"),
            actual: format!("held by {}", lease.agent_id),
        });
    }
    if claim_version.is_some_and(|v| v != lease.claim_version) {
        return Err(stale_claim(
            id,
            claim_version.unwrap_or_default(),
            Some(lease.claim_version),
        ));
    }
    Ok(lease.clone())
}

/// Return a claimed task to Ready without charging an attempt.
fn release_claim(task: &mut Task) -> Result<(), CoreError> {
    task.transition(TaskStatus::Ready)?;
    task.assigned_agent_id = None;
    task.claim_version = None;
    task.started_at = None;
    Ok(())
}

fn check_claim(task: &Task, claim_version: u64) -> Result<(), CoreError> {
    if task.claim_version == Some(claim_version) {
        Ok(())
    } else {
        Err(stale_claim(&task.id, claim_version, task.claim_version))
    }
}

fn stale_claim(id: &TaskId, expected: u64, actual: Option<u64>) -> CoreError {
    CoreError::StalePrecondition {
        task: id.clone(),
        expected: format!("claim@{expected}"),
        actual: actual.map_or_else(|| "unclaimed".to_string(), |v| format!("claim@{v}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetrun_core::TaskSpec;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut spec = TaskSpec::new("build").with_id(id);
        for dep in deps {
            spec = spec.depends_on(*dep);
        }
        spec.into_task(Utc::now())
    }

    #[test]
    fn test_initial_statuses_ready_pending_and_cancelled() {
        let mut batch = vec![
            task("free", &[]),
            task("after-done", &["done"]),
            task("after-free", &["free"]),
            task("after-dead", &["dead"]),
            task("chained", &["after-dead"]),
        ];
        let external: HashMap<TaskId, TaskStatus> = [
            (TaskId::new("done"), TaskStatus::Completed),
            (TaskId::new("dead"), TaskStatus::DeadLettered),
        ]
        .into_iter()
        .collect();

        resolve_initial_statuses(&mut batch, &external, Utc::now()).unwrap();
        let statuses: Vec<TaskStatus> = batch.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Ready,
                TaskStatus::Ready,
                TaskStatus::Pending,
                TaskStatus::Cancelled,
                TaskStatus::Cancelled,
            ]
        );
        assert!(batch[4].error.as_deref().unwrap().contains("after-dead"));
    }

    #[tokio::test]
    async fn test_claim_interleaved_with_deregistration_returns_task_to_ready() {
        let clock = Arc::new(crate::clock::ManualClock::new(Utc::now()));
        let orch = Orchestrator::with_clock(Config::default(), clock);
        orch.register_agent(AgentSpec::new("builder").with_id("a1").with_capability("build"))
            .await
            .unwrap();
        orch.submit(vec![TaskSpec::new("build").with_id("t")])
            .await
            .unwrap();
        let id = TaskId::new("t");
        let agent = AgentId::new("a1");
        let version = orch.store.get(&id).await.unwrap().version;

        // Holding the lease table parks the claim after its reservation and
        // the deregistration after it removed the agent, in that order.
        let leases = orch.leases.lock().await;
        let claim = tokio::spawn({
            let orch = Arc::clone(&orch);
            let (id, agent) = (id.clone(), agent.clone());
            async move { orch.claim(&id, version, &agent).await }
        });
        while orch
            .registry
            .get(&agent)
            .await
            .map_or(true, |a| a.active_tasks.is_empty())
        {
            tokio::task::yield_now().await;
        }
        let deregister = tokio::spawn({
            let orch = Arc::clone(&orch);
            let agent = agent.clone();
            async move { orch.deregister_agent(&agent, DeregisterReason::Shutdown).await }
        });
        while orch.registry.contains(&agent).await {
            tokio::task::yield_now().await;
        }
        drop(leases);

        assert!(matches!(
            claim.await.unwrap(),
            Err(DispatchError::AgentUnavailable(_))
        ));
        deregister.await.unwrap().unwrap();

        let task = orch.store.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.attempt_count, 0);
        assert!(task.assigned_agent_id.is_none());
        assert!(orch.queue.lock().await.contains(&id));
        assert!(orch.leases.lock().await.is_empty());
    }

    #[test]
    fn test_current_lease_rejects_other_agents_and_old_claims() {
        let id = TaskId::new("t");
        let mut leases = HashMap::new();
        leases.insert(
            id.clone(),
            Lease {
                agent_id: AgentId::new("a"),
                claim_version: 7,
                deadline: Utc::now(),
                explicit_deadline: false,
                cancel: CancellationToken::new(),
                cancel_requested_at: None,
            },
        );

        assert!(current_lease(&leases, &id, &AgentId::new("a"), Some(7)).is_ok());
        assert!(current_lease(&leases, &id, &AgentId::new("a"), None).is_ok());
        assert!(matches!(
            current_lease(&leases, &id, &AgentId::new("b"), None),
            Err(CoreError::StalePrecondition { .. })
        ));
        assert!(matches!(
            current_lease(&leases, &id, &AgentId::new("a"), Some(3)),
            Err(CoreError::StalePrecondition { .. })
        ));
    }
}
