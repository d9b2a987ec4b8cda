//! Task and dead-letter storage.
//!
//! The task store keeps one record per task, stamped with a monotonically
//! increasing sequence on every write. All mutations are conditional: callers
//! state the statuses (and for claims, the version) they expect, and a write
//! whose precondition no longer holds fails with
//! [`CoreError::StalePrecondition`] instead of overwriting a concurrent change.
//!
//! The dead-letter store is append-only.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::RwLock;

use fleetrun_core::{AgentId, CoreError, DeadLetterEntry, DeadLetterId, Task, TaskId, TaskStatus};

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<TaskId, Task>,
    sequence: u64,
}

impl StoreInner {
    fn next_version(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

/// Durable record of tasks and their state transitions.
#[derive(Default)]
pub struct TaskStore {
    inner: RwLock<StoreInner>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a batch of new tasks. Either every task is stored or none is.
    pub async fn insert_batch(&self, tasks: Vec<Task>) -> Result<Vec<Task>, CoreError> {
        let mut inner = self.inner.write().await;

        for task in &tasks {
            if inner.tasks.contains_key(&task.id) {
                return Err(CoreError::DuplicateTask(task.id.clone()));
            }
        }

        let mut stored = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.version = inner.next_version();
            inner.tasks.insert(task.id.clone(), task.clone());
            stored.push(task);
        }
        Ok(stored)
    }

    /// Get a task by id.
    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        self.inner.read().await.tasks.get(id).cloned()
    }

    pub async fn contains(&self, id: &TaskId) -> bool {
        self.inner.read().await.tasks.contains_key(id)
    }

    /// Current status of each requested task that exists.
    pub async fn statuses<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a TaskId>,
    ) -> HashMap<TaskId, TaskStatus> {
        let inner = self.inner.read().await;
        ids.into_iter()
            .filter_map(|id| inner.tasks.get(id).map(|t| (id.clone(), t.status)))
            .collect()
    }

    /// Status of every stored task.
    pub async fn status_map(&self) -> HashMap<TaskId, TaskStatus> {
        let inner = self.inner.read().await;
        inner.tasks.iter().map(|(id, t)| (id.clone(), t.status)).collect()
    }

    /// List tasks ordered by creation time, optionally filtered by status.
    pub async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Vec<Task> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.version.cmp(&b.version)));
        tasks.truncate(limit);
        tasks
    }

    pub async fn count_by_status(&self) -> BTreeMap<TaskStatus, usize> {
        let inner = self.inner.read().await;
        let mut counts: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for task in inner.tasks.values() {
            *counts.entry(task.status).or_default() += 1;
        }
        counts
    }

    /// Apply `update` if the task's status is one of `expected`.
    ///
    /// The closure runs under the store's write lock against a copy of the
    /// record; the copy replaces the record only if the closure succeeds.
    pub async fn update_if<F>(
        &self,
        id: &TaskId,
        expected: &[TaskStatus],
        update: F,
    ) -> Result<Task, CoreError>
    where
        F: FnOnce(&mut Task) -> Result<(), CoreError>,
    {
        let mut inner = self.inner.write().await;
        let current = inner
            .tasks
            .get(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.clone()))?;

        if !expected.contains(&current.status) {
            return Err(CoreError::StalePrecondition {
                task: id.clone(),
                expected: format_statuses(expected),
                actual: current.status.to_string(),
            });
        }

        let mut next = current.clone();
        update(&mut next)?;
        next.version = inner.next_version();
        inner.tasks.insert(id.clone(), next.clone());
        Ok(next)
    }

    /// Claim a Ready task for `agent_id`.
    ///
    /// Succeeds only if the task is still Ready at `expected_version`; of any
    /// number of concurrent claims observing the same version, exactly one wins.
    pub async fn claim(
        &self,
        id: &TaskId,
        expected_version: u64,
        agent_id: &AgentId,
    ) -> Result<Task, CoreError> {
        let mut inner = self.inner.write().await;
        let current = inner
            .tasks
            .get(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.clone()))?;

        if current.status != TaskStatus::Ready || current.version != expected_version {
            return Err(CoreError::StalePrecondition {
                task: id.clone(),
                expected: format!("ready@{expected_version}"),
                actual: format!("{}@{}", current.status, current.version),
            });
        }

        let mut next = current.clone();
        next.transition(TaskStatus::Assigned)?;
        next.assigned_agent_id = Some(agent_id.clone());
        next.started_at = None;
        let version = inner.next_version();
        next.version = version;
        next.claim_version = Some(version);
        inner.tasks.insert(id.clone(), next.clone());
        Ok(next)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn format_statuses(statuses: &[TaskStatus]) -> String {
    statuses
        .iter()
        .map(TaskStatus::as_label)
        .collect::<Vec<_>>()
        .join("|")
}

/// Append-only store of dead-letter entries.
#[derive(Default)]
pub struct DeadLetterStore {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl DeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, entry: DeadLetterEntry) {
        self.entries.write().await.push(entry);
    }

    /// Entries in the order they were written.
    pub async fn list(&self) -> Vec<DeadLetterEntry> {
        self.entries.read().await.clone()
    }

    pub async fn get(&self, id: &DeadLetterId) -> Option<DeadLetterEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| &e.id == id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetrun_core::TaskSpec;

    fn task(id: &str) -> Task {
        TaskSpec::new("test").with_id(id).into_task(Utc::now())
    }

    async fn ready(store: &TaskStore, id: &str) -> Task {
        store
            .update_if(&TaskId::new(id), &[TaskStatus::Pending], |t| {
                t.transition(TaskStatus::Ready)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_batch_is_all_or_nothing() {
        let store = TaskStore::new();
        store.insert_batch(vec![task("a")]).await.unwrap();

        let err = store
            .insert_batch(vec![task("b"), task("a")])
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::DuplicateTask(TaskId::new("a")));
        assert!(!store.contains(&TaskId::new("b")).await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_versions_increase_on_every_write() {
        let store = TaskStore::new();
        let inserted = store.insert_batch(vec![task("a")]).await.unwrap();
        let updated = ready(&store, "a").await;
        assert!(updated.version > inserted[0].version);
    }

    #[tokio::test]
    async fn test_update_if_rejects_unexpected_status() {
        let store = TaskStore::new();
        store.insert_batch(vec![task("a")]).await.unwrap();

        let err = store
            .update_if(&TaskId::new("a"), &[TaskStatus::Running], |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StalePrecondition { .. }));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_record_untouched() {
        let store = TaskStore::new();
        store.insert_batch(vec![task("a")]).await.unwrap();

        let result = store
            .update_if(&TaskId::new("a"), &[TaskStatus::Pending], |t| {
                t.attempt_count = 9;
                t.transition(TaskStatus::Completed)
            })
            .await;
        assert!(result.is_err());
        let stored = store.get(&TaskId::new("a")).await.unwrap();
        assert_eq!(stored.attempt_count, 0);
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_claim_has_single_winner() {
        let store = TaskStore::new();
        store.insert_batch(vec![task("a")]).await.unwrap();
        let observed = ready(&store, "a").await;

        let first = store
            .claim(&observed.id, observed.version, &AgentId::new("x"))
            .await;
        let second = store
            .claim(&observed.id, observed.version, &AgentId::new("y"))
            .await;

        let winner = first.unwrap();
        assert_eq!(winner.status, TaskStatus::Assigned);
        assert_eq!(winner.assigned_agent_id, Some(AgentId::new("x")));
        assert_eq!(winner.claim_version, Some(winner.version));
        assert!(matches!(second, Err(CoreError::StalePrecondition { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_claims_exactly_one_succeeds() {
        let store = std::sync::Arc::new(TaskStore::new());
        store.insert_batch(vec![task("a")]).await.unwrap();
        let observed = ready(&store, "a").await;

        let mut handles = Vec::new();
        for n in 0..8 {
            let store = store.clone();
            let id = observed.id.clone();
            let version = observed.version;
            handles.push(tokio::spawn(async move {
                store
                    .claim(&id, version, &AgentId::new(format!("agent-{n}")))
                    .await
                    .is_ok()
            }));
        }

        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_store_is_append_only() {
        let store = DeadLetterStore::new();
        let t = task("a");
        let entry = DeadLetterEntry::from_task(&t, "boom", Utc::now());
        let id = entry.id.clone();
        store.append(entry.clone()).await;

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&id).await, Some(entry));
    }
}
