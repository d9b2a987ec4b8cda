//! End-to-end orchestration scenarios against an in-process orchestrator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use fleetrun_control_plane::autoscale::features::pool;
use fleetrun_control_plane::{
    AgentError, AgentExecutor, Autoscaler, Config, DeregisterReason, DispatchError, Dispatcher,
    ManualClock, Orchestrator,
};
use fleetrun_core::{
    AgentId, AgentSpec, CompletionReport, CoreError, FailureKind, FailureReport, Priority, Task,
    TaskFailure, TaskId, TaskSpec, TaskStatus,
};

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    orch: Arc<Orchestrator>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let orch = Orchestrator::with_clock(config, clock.clone());
        Self { orch, clock }
    }

    async fn agent(&self, id: &str, max: u32) {
        self.orch
            .register_agent(
                AgentSpec::new("builder")
                    .with_id(id)
                    .with_capability("build")
                    .with_max_concurrent(max),
            )
            .await
            .unwrap();
    }

    async fn submit(&self, specs: Vec<TaskSpec>) {
        self.orch.submit(specs).await.unwrap();
    }

    async fn task(&self, id: &str) -> Task {
        self.orch.task(&TaskId::new(id)).await.unwrap()
    }

    async fn status(&self, id: &str) -> TaskStatus {
        self.task(id).await.status
    }

    async fn dispatch(&self) -> usize {
        Dispatcher::new(Arc::clone(&self.orch), 0, 1)
            .dispatch_cycle()
            .await
    }

    async fn claim(&self, task: &str, agent: &str) -> Result<Task, DispatchError> {
        let version = self.task(task).await.version;
        self.orch
            .claim(&TaskId::new(task), version, &AgentId::new(agent))
            .await
    }

    async fn complete(&self, task: &str) -> Task {
        let current = self.task(task).await;
        let agent_id = current.assigned_agent_id.expect("task is not claimed");
        self.orch
            .complete(
                &TaskId::new(task),
                CompletionReport {
                    agent_id,
                    claim_version: current.claim_version,
                    result: json!({ "ok": true }),
                },
            )
            .await
            .unwrap()
    }

    async fn fail(&self, task: &str, kind: FailureKind) -> Task {
        let current = self.task(task).await;
        let agent_id = current.assigned_agent_id.expect("task is not claimed");
        self.orch
            .fail(
                &TaskId::new(task),
                FailureReport {
                    agent_id,
                    claim_version: current.claim_version,
                    failure: TaskFailure::new(kind, "boom"),
                },
            )
            .await
            .unwrap()
    }

    async fn wait_for(&self, task: &str, status: TaskStatus) {
        for _ in 0..400 {
            if self.status(task).await == status {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!(
            "task {task} never reached {status}, stuck at {}",
            self.status(task).await
        );
    }
}

fn build(id: &str) -> TaskSpec {
    TaskSpec::new("build").with_id(id)
}

/// Executor that plays back scripted outcomes, or waits for cancellation.
enum Script {
    Reply(Result<Value, AgentError>),
    WaitForCancel { acknowledge: bool },
}

struct ScriptedExecutor {
    script: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, _task: &Task, cancel: CancellationToken) -> Result<Value, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Script::Reply(result)) => result,
            Some(Script::WaitForCancel { acknowledge }) => {
                cancel.cancelled().await;
                if acknowledge {
                    Err(AgentError::Cancelled)
                } else {
                    std::future::pending().await
                }
            }
            None => Ok(json!({ "default": true })),
        }
    }

    async fn heartbeat(&self) -> bool {
        true
    }
}

// ============================================================================
// Submission and dependencies
// ============================================================================

#[tokio::test]
async fn test_cyclic_batch_leaves_store_unchanged() {
    let h = Harness::new();
    let err = h
        .orch
        .submit(vec![
            build("a").depends_on("c"),
            build("b").depends_on("a"),
            build("c").depends_on("b"),
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::CyclicDependency(_)));
    assert!(h.orch.list_tasks(None, 100).await.is_empty());
    assert_eq!(h.orch.queue_utilization().await, 0.0);
}

#[tokio::test]
async fn test_unknown_dependency_rejects_whole_batch() {
    let h = Harness::new();
    let err = h
        .orch
        .submit(vec![build("a"), build("b").depends_on("ghost")])
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::UnknownDependency { .. }));
    assert!(h.orch.task(&TaskId::new("a")).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deep_chain_listed_newest_first_is_accepted() {
    let h = Harness::new();
    let depth = 30_000;
    let specs: Vec<TaskSpec> = (0..depth)
        .rev()
        .map(|n| {
            let spec = build(&format!("t{n}"));
            if n == 0 {
                spec
            } else {
                spec.depends_on(format!("t{}", n - 1))
            }
        })
        .collect();

    let orch = Arc::clone(&h.orch);
    let accepted = tokio::spawn(async move { orch.submit(specs).await })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(accepted.len(), depth);
    assert_eq!(h.status("t0").await, TaskStatus::Ready);
    assert_eq!(h.status(&format!("t{}", depth - 1)).await, TaskStatus::Pending);
}

#[tokio::test]
async fn test_linear_chain_runs_in_order() {
    let h = Harness::new();
    h.agent("a1", 4).await;
    h.submit(vec![
        build("A"),
        build("B").depends_on("A"),
        build("C").depends_on("B"),
    ])
    .await;
    assert_eq!(h.status("A").await, TaskStatus::Ready);
    assert_eq!(h.status("B").await, TaskStatus::Pending);

    assert_eq!(h.dispatch().await, 1);
    h.complete("A").await;
    assert_eq!(h.status("B").await, TaskStatus::Ready);
    assert_eq!(h.status("C").await, TaskStatus::Pending);

    assert_eq!(h.dispatch().await, 1);
    h.complete("B").await;
    assert_eq!(h.dispatch().await, 1);
    let c = h.complete("C").await;
    assert_eq!(c.status, TaskStatus::Completed);
    assert_eq!(c.result, Some(json!({ "ok": true })));
}

#[tokio::test]
async fn test_diamond_waits_for_every_dependency() {
    let h = Harness::new();
    h.agent("a1", 4).await;
    h.submit(vec![
        build("root"),
        build("left").depends_on("root"),
        build("right").depends_on("root"),
        build("join").depends_on("left").depends_on("right"),
    ])
    .await;

    h.dispatch().await;
    h.complete("root").await;
    assert_eq!(h.dispatch().await, 2);
    h.complete("left").await;
    assert_eq!(h.status("join").await, TaskStatus::Pending);
    h.complete("right").await;
    assert_eq!(h.status("join").await, TaskStatus::Ready);
}

#[tokio::test]
async fn test_cancelling_chain_head_cancels_dependents() {
    let h = Harness::new();
    h.submit(vec![
        build("A"),
        build("B").depends_on("A"),
        build("C").depends_on("B"),
    ])
    .await;

    let a = h.orch.cancel(&TaskId::new("A")).await.unwrap();
    assert_eq!(a.status, TaskStatus::Cancelled);
    assert_eq!(h.status("B").await, TaskStatus::Cancelled);
    assert_eq!(h.status("C").await, TaskStatus::Cancelled);
    assert!(h.task("C").await.error.unwrap().contains('B'));
    assert_eq!(h.orch.queue_utilization().await, 0.0);
}

#[tokio::test]
async fn test_submission_depending_on_cancelled_task_is_cancelled() {
    let h = Harness::new();
    h.submit(vec![build("gone")]).await;
    h.orch.cancel(&TaskId::new("gone")).await.unwrap();

    let accepted = h
        .orch
        .submit(vec![build("late").depends_on("gone"), build("later").depends_on("late")])
        .await
        .unwrap();
    assert_eq!(accepted[0].status, TaskStatus::Cancelled);
    assert_eq!(accepted[1].status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_submission_depending_on_completed_task_is_ready() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    h.submit(vec![build("done")]).await;
    h.dispatch().await;
    h.complete("done").await;

    let accepted = h.orch.submit(vec![build("next").depends_on("done")]).await.unwrap();
    assert_eq!(accepted[0].status, TaskStatus::Ready);
}

#[tokio::test]
async fn test_cancel_terminal_task_is_rejected() {
    let h = Harness::new();
    h.submit(vec![build("t")]).await;
    h.orch.cancel(&TaskId::new("t")).await.unwrap();
    let err = h.orch.cancel(&TaskId::new("t")).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
}

// ============================================================================
// Queue saturation
// ============================================================================

#[tokio::test]
async fn test_saturation_sheds_submissions_at_threshold() {
    let mut config = Config::default();
    config.queue.capacity = 10;
    config.queue.shed_threshold = 0.9;
    let h = Harness::with_config(config);

    for n in 0..9 {
        h.submit(vec![build(&format!("t{n}"))]).await;
    }
    let err = h
        .orch
        .submit(vec![build("t9").with_priority(Priority::Critical)])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::QueueSaturated { queued: 9, capacity: 10 }));
    assert!(h.orch.task(&TaskId::new("t9")).await.is_err());
}

#[tokio::test]
async fn test_oversized_batch_is_rejected_atomically() {
    let mut config = Config::default();
    config.queue.capacity = 10;
    let h = Harness::with_config(config);

    let batch: Vec<TaskSpec> = (0..12).map(|n| build(&format!("t{n}"))).collect();
    let err = h.orch.submit(batch).await.unwrap_err();
    assert!(matches!(err, CoreError::QueueSaturated { .. }));
    assert!(h.orch.list_tasks(None, 100).await.is_empty());
}

// ============================================================================
// Claims
// ============================================================================

#[tokio::test]
async fn test_concurrent_claims_exactly_one_wins() {
    let h = Harness::new();
    for n in 0..8 {
        h.agent(&format!("a{n}"), 1).await;
    }
    h.submit(vec![build("t")]).await;
    let version = h.task("t").await.version;

    let mut handles = Vec::new();
    for n in 0..8 {
        let orch = Arc::clone(&h.orch);
        handles.push(tokio::spawn(async move {
            orch.claim(&TaskId::new("t"), version, &AgentId::new(format!("a{n}")))
                .await
        }));
    }

    let mut wins = 0;
    let mut stale = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(DispatchError::Claim(CoreError::StalePrecondition { .. })) => stale += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((wins, stale), (1, 7));

    let held: usize = h
        .orch
        .agents()
        .await
        .iter()
        .map(|a| a.active_tasks.len())
        .sum();
    assert_eq!(held, 1);
}

#[tokio::test]
async fn test_agent_never_exceeds_max_concurrency() {
    let h = Harness::new();
    h.agent("a1", 2).await;
    let batch: Vec<TaskSpec> = (0..10).map(|n| build(&format!("t{n}"))).collect();
    h.submit(batch).await;

    let mut handles = Vec::new();
    for n in 0..10 {
        let orch = Arc::clone(&h.orch);
        let id = TaskId::new(format!("t{n}"));
        let version = orch.task(&id).await.unwrap().version;
        handles.push(tokio::spawn(async move {
            orch.claim(&id, version, &AgentId::new("a1")).await
        }));
    }
    let wins = futures_count(handles).await;
    assert_eq!(wins, 2);

    let agent = h.orch.agent(&AgentId::new("a1")).await.unwrap();
    assert_eq!(agent.active_tasks.len(), 2);
}

async fn futures_count(
    handles: Vec<tokio::task::JoinHandle<Result<Task, DispatchError>>>,
) -> usize {
    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            wins += 1;
        }
    }
    wins
}

#[tokio::test]
async fn test_report_from_wrong_agent_is_stale() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    h.agent("a2", 1).await;
    h.submit(vec![build("t")]).await;
    h.claim("t", "a1").await.unwrap();

    let err = h
        .orch
        .complete(
            &TaskId::new("t"),
            CompletionReport {
                agent_id: AgentId::new("a2"),
                claim_version: None,
                result: Value::Null,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StalePrecondition { .. }));
    assert_eq!(h.status("t").await, TaskStatus::Assigned);
}

// ============================================================================
// Faults
// ============================================================================

#[tokio::test]
async fn test_transient_failures_retry_then_dead_letter() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    h.submit(vec![build("t"), build("child").depends_on("t")]).await;

    for attempt in 1..=2 {
        h.dispatch().await;
        let task = h.fail("t", FailureKind::TransientAgent).await;
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.attempt_count, attempt);
        assert_eq!(task.assigned_agent_id, None);
    }

    h.dispatch().await;
    let task = h.fail("t", FailureKind::TransientAgent).await;
    assert_eq!(task.status, TaskStatus::DeadLettered);
    assert_eq!(task.attempt_count, 3);
    assert_eq!(task.attempt_history.len(), 3);
    assert!(task.error.unwrap().contains("retries exhausted"));

    let dead = h.orch.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_id, TaskId::new("t"));
    assert_eq!(h.status("child").await, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_non_retryable_failure_dead_letters_immediately() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    h.submit(vec![build("t")]).await;
    h.dispatch().await;

    let task = h.fail("t", FailureKind::PayloadValidation).await;
    assert_eq!(task.status, TaskStatus::DeadLettered);
    assert_eq!(task.attempt_count, 1);
    // Payload errors do not count against the agent.
    let agent = h.orch.agent(&AgentId::new("a1")).await.unwrap();
    assert_eq!(agent.consecutive_failures, 0);
}

#[tokio::test]
async fn test_infrastructure_failure_requeues_without_charging() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    h.submit(vec![build("t")]).await;
    h.dispatch().await;

    let task = h.fail("t", FailureKind::AgentUnreachable).await;
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.attempt_count, 0);
    assert_eq!(task.attempt_history.len(), 1);
}

#[tokio::test]
async fn test_retry_prefers_a_different_agent() {
    let h = Harness::new();
    h.agent("a1", 4).await;
    h.agent("a2", 4).await;
    h.submit(vec![build("t")]).await;

    h.dispatch().await;
    let first = h.task("t").await.assigned_agent_id.unwrap();
    h.fail("t", FailureKind::TransientAgent).await;

    h.dispatch().await;
    let second = h.task("t").await.assigned_agent_id.unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_breaker_opens_then_allows_one_probe() {
    let h = Harness::new();
    h.agent("a1", 10).await;
    let batch: Vec<TaskSpec> = (0..7).map(|n| build(&format!("t{n}"))).collect();
    h.submit(batch).await;

    for n in 0..5 {
        let id = format!("t{n}");
        h.claim(&id, "a1").await.unwrap();
        h.fail(&id, FailureKind::AgentUnreachable).await;
    }
    assert!(matches!(
        h.claim("t5", "a1").await,
        Err(DispatchError::AgentUnavailable(_))
    ));
    assert_eq!(h.dispatch().await, 0);

    h.clock.advance(Duration::seconds(61));
    h.claim("t5", "a1").await.unwrap();
    assert!(matches!(
        h.claim("t6", "a1").await,
        Err(DispatchError::AgentUnavailable(_))
    ));

    h.complete("t5").await;
    h.claim("t6", "a1").await.unwrap();
}

#[tokio::test]
async fn test_reprocessing_twice_creates_independent_tasks() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    h.submit(vec![build("t").with_payload(json!({ "n": 1 }))]).await;
    h.dispatch().await;
    h.fail("t", FailureKind::PayloadValidation).await;

    let entry = h.orch.dead_letters().await.remove(0);
    let first = h.orch.reprocess(&entry.id).await.unwrap();
    let second = h.orch.reprocess(&entry.id).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_ne!(first.id, TaskId::new("t"));
    assert_eq!(first.derived_from, Some(entry.id.clone()));
    assert_eq!(second.payload, json!({ "n": 1 }));
    assert_eq!(second.status, TaskStatus::Ready);
    assert_eq!(h.orch.dead_letter(&entry.id).await.unwrap(), entry);
}

// ============================================================================
// Timeouts, cancellation and agent loss
// ============================================================================

#[tokio::test]
async fn test_deadline_sweep_times_out_running_task() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    h.submit(vec![build("t")]).await;
    h.dispatch().await;

    assert!(h.orch.sweep().await.timed_out.is_empty());
    h.clock.advance(Duration::seconds(301));
    let report = h.orch.sweep().await;
    assert_eq!(report.timed_out, vec![TaskId::new("t")]);

    let task = h.task("t").await;
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.attempt_count, 1);
    assert!(task.error.unwrap().starts_with("timeout"));
}

#[tokio::test]
async fn test_explicit_deadline_overrides_sla() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    let deadline = h.orch.now() + Duration::seconds(20);
    h.submit(vec![build("t").with_deadline(deadline)]).await;
    h.dispatch().await;

    h.clock.advance(Duration::seconds(15));
    assert!(h.orch.sweep().await.timed_out.is_empty());
    h.clock.advance(Duration::seconds(10));
    assert_eq!(h.orch.sweep().await.timed_out, vec![TaskId::new("t")]);
}

#[tokio::test]
async fn test_report_after_cancel_request_finishes_cancelled() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    h.submit(vec![build("t"), build("child").depends_on("t")]).await;
    h.dispatch().await;

    let pending = h.orch.cancel(&TaskId::new("t")).await.unwrap();
    assert_eq!(pending.status, TaskStatus::Assigned);

    let task = h.complete("t").await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(h.status("child").await, TaskStatus::Cancelled);
    let agent = h.orch.agent(&AgentId::new("a1")).await.unwrap();
    assert!(agent.active_tasks.is_empty());
}

#[tokio::test]
async fn test_unacknowledged_cancel_fails_after_grace() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    h.submit(vec![build("t"), build("child").depends_on("t")]).await;
    h.dispatch().await;
    h.orch.cancel(&TaskId::new("t")).await.unwrap();

    h.clock.advance(Duration::seconds(10));
    assert!(h.orch.sweep().await.forced_failures.is_empty());

    h.clock.advance(Duration::seconds(25));
    let report = h.orch.sweep().await;
    assert_eq!(report.forced_failures, vec![TaskId::new("t")]);
    assert_eq!(h.status("t").await, TaskStatus::Failed);
    assert_eq!(h.status("child").await, TaskStatus::Cancelled);
    assert!(h.orch.dead_letters().await.is_empty());
}

#[tokio::test]
async fn test_deregistration_requeues_held_tasks() {
    let h = Harness::new();
    h.agent("a1", 2).await;
    h.submit(vec![build("t1"), build("t2")]).await;
    assert_eq!(h.dispatch().await, 2);

    let requeued = h
        .orch
        .deregister_agent(&AgentId::new("a1"), DeregisterReason::Shutdown)
        .await
        .unwrap();
    assert_eq!(requeued.len(), 2);
    let t1 = h.task("t1").await;
    assert_eq!(t1.status, TaskStatus::Ready);
    assert_eq!(t1.attempt_count, 0);

    h.agent("a2", 2).await;
    assert_eq!(h.dispatch().await, 2);
}

#[tokio::test]
async fn test_completed_elsewhere_leaves_tasks_claimed() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    h.submit(vec![build("t")]).await;
    h.dispatch().await;

    let requeued = h
        .orch
        .deregister_agent(&AgentId::new("a1"), DeregisterReason::CompletedElsewhere)
        .await
        .unwrap();
    assert!(requeued.is_empty());
    assert_eq!(h.status("t").await, TaskStatus::Assigned);

    // The late report still lands.
    assert_eq!(h.complete("t").await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_missed_heartbeats_deregister_agent() {
    let h = Harness::new();
    h.agent("a1", 1).await;
    h.agent("a2", 1).await;
    h.submit(vec![build("t")]).await;
    h.claim("t", "a1").await.unwrap();

    h.clock.advance(Duration::seconds(30));
    h.orch.heartbeat(&AgentId::new("a2")).await.unwrap();
    h.clock.advance(Duration::seconds(16));

    let report = h.orch.sweep().await;
    assert_eq!(report.deregistered, vec![AgentId::new("a1")]);
    assert_eq!(h.status("t").await, TaskStatus::Ready);
    assert!(h.orch.agent(&AgentId::new("a2")).await.is_ok());
}

// ============================================================================
// Executors
// ============================================================================

#[tokio::test]
async fn test_executor_runs_task_and_readies_dependents() {
    let h = Harness::new();
    let executor = ScriptedExecutor::new(vec![Script::Reply(Ok(json!({ "lines": 42 })))]);
    h.orch
        .register_agent_with_executor(AgentSpec::new("build").with_id("exec"), executor.clone())
        .await
        .unwrap();
    h.submit(vec![build("t"), build("next").depends_on("t")]).await;

    h.dispatch().await;
    h.wait_for("t", TaskStatus::Completed).await;
    assert_eq!(h.task("t").await.result, Some(json!({ "lines": 42 })));
    assert_eq!(h.status("next").await, TaskStatus::Ready);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_executor_failure_is_retried() {
    let h = Harness::new();
    let executor = ScriptedExecutor::new(vec![
        Script::Reply(Err(AgentError::Timeout)),
        Script::Reply(Ok(json!("done"))),
    ]);
    h.orch
        .register_agent_with_executor(AgentSpec::new("build").with_id("exec"), executor.clone())
        .await
        .unwrap();
    h.submit(vec![build("t")]).await;

    h.dispatch().await;
    h.wait_for("t", TaskStatus::Ready).await;
    assert_eq!(h.task("t").await.attempt_count, 1);

    h.dispatch().await;
    h.wait_for("t", TaskStatus::Completed).await;
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_executor_acknowledges_cancellation() {
    let h = Harness::new();
    let executor = ScriptedExecutor::new(vec![Script::WaitForCancel { acknowledge: true }]);
    h.orch
        .register_agent_with_executor(AgentSpec::new("build").with_id("exec"), executor)
        .await
        .unwrap();
    h.submit(vec![build("t")]).await;

    h.dispatch().await;
    h.wait_for("t", TaskStatus::Running).await;
    h.orch.cancel(&TaskId::new("t")).await.unwrap();
    h.wait_for("t", TaskStatus::Cancelled).await;
}

#[tokio::test]
async fn test_executor_ignoring_cancellation_is_failed_by_sweep() {
    let h = Harness::new();
    let executor = ScriptedExecutor::new(vec![Script::WaitForCancel { acknowledge: false }]);
    h.orch
        .register_agent_with_executor(AgentSpec::new("build").with_id("exec"), executor)
        .await
        .unwrap();
    h.submit(vec![build("t")]).await;

    h.dispatch().await;
    h.wait_for("t", TaskStatus::Running).await;
    h.orch.cancel(&TaskId::new("t")).await.unwrap();
    h.clock.advance(Duration::seconds(31));
    h.orch.sweep().await;
    assert_eq!(h.status("t").await, TaskStatus::Failed);
}

// ============================================================================
// Critical path and metrics
// ============================================================================

#[tokio::test]
async fn test_critical_path_skips_finished_work() {
    let h = Harness::new();
    h.agent("a1", 4).await;
    h.submit(vec![
        build("a").with_complexity(1.0),
        build("b").depends_on("a").with_complexity(5.0),
        build("c").depends_on("a").with_complexity(1.0),
        build("d").depends_on("b").depends_on("c").with_complexity(2.0),
    ])
    .await;

    let path = h.orch.critical_path().await;
    let ids: Vec<&str> = path.tasks.iter().map(TaskId::as_str).collect();
    assert_eq!(ids, vec!["a", "b", "d"]);
    // default duration 60s per unit of complexity
    assert!((path.total_weight - 480.0).abs() < 1e-9);

    h.dispatch().await;
    h.complete("a").await;
    let path = h.orch.critical_path().await;
    assert!(!path.tasks.contains(&TaskId::new("a")));
}

#[tokio::test]
async fn test_metric_snapshot_reflects_queue_and_pools() {
    let h = Harness::new();
    h.agent("a1", 2).await;
    h.submit(vec![build("x"), build("y").depends_on("x")]).await;

    let snapshot = h.orch.metric_snapshot();
    let arrivals = snapshot.arrivals.unwrap();
    assert_eq!(arrivals.last_1m, 2);
    assert_eq!(snapshot.queued_by_type.unwrap().get("build"), Some(&1));
    let pools = snapshot.pools.unwrap();
    assert_eq!(pools["builder"].agents, 1);
    assert!(pools["builder"].capabilities.contains("build"));
    assert_eq!(snapshot.dependency_ratio, Some(0.5));
}

// ============================================================================
// Autoscaling
// ============================================================================

#[tokio::test]
async fn test_queued_work_drives_scaling_of_the_serving_pool() {
    let h = Harness::new();
    h.agent("b1", 4).await;
    let specs: Vec<TaskSpec> = (0..12).map(|n| build(&format!("t{n}"))).collect();
    h.submit(specs).await;

    let autoscaler = Autoscaler::new(h.orch.config());
    for _ in 0..12 {
        autoscaler.sample(&h.orch.metric_snapshot()).await;
        h.clock.advance(Duration::seconds(10));
    }

    let features = autoscaler.latest_features().await.unwrap();
    assert_eq!(features.agent_types(), vec!["builder".to_string()]);
    assert_eq!(features.pool("builder", pool::DEMAND), 12.0);
    assert_eq!(features.required_agents("builder"), 3.0);

    let decisions = autoscaler
        .evaluate(h.orch.now(), &h.orch.pool_stats().await)
        .await;
    assert_eq!(decisions.len(), 1);
    let decision = &decisions[0];
    assert_eq!(decision.agent_type, "builder");
    assert_eq!(decision.current_count, 1);
    assert_eq!(decision.target_count, 3);
}
