//! Five-tier priority queue with load shedding.
//!
//! Each priority tier is a FIFO. Dequeue always serves the highest non-empty
//! tier first, and within a tier the oldest task first. New submissions are
//! shed once the queue reaches its saturation threshold; tasks that were
//! already admitted (retries, requeues after agent loss) always go back in.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use thiserror::Error;

use fleetrun_core::{CoreError, Priority, Task, TaskId};

/// Queue admission errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Queue saturated: {queued} queued, capacity {capacity}")]
    Saturated { queued: usize, capacity: usize },
}

impl From<QueueError> for CoreError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Saturated { queued, capacity } => {
                CoreError::QueueSaturated { queued, capacity }
            }
        }
    }
}

/// A queued reference to a Ready task.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub id: TaskId,
    pub task_type: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    seq: u64,
}

impl QueuedTask {
    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.seq)
    }
}

pub struct PriorityQueue {
    tiers: [VecDeque<QueuedTask>; Priority::COUNT],
    capacity: usize,
    shed_threshold: f64,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new(capacity: usize, shed_threshold: f64) -> Self {
        Self {
            tiers: Default::default(),
            capacity: capacity.max(1),
            shed_threshold,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fraction of capacity in use.
    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Whether `n` more submissions would be admitted.
    ///
    /// The queue is saturated when it is full or when its utilization has
    /// reached the shed threshold.
    pub fn can_admit(&self, n: usize) -> bool {
        if n == 0 {
            return true;
        }
        // Every enqueue but the last must leave room for the next one.
        let after = self.len() + n - 1;
        after < self.capacity && (after as f64 / self.capacity as f64) < self.shed_threshold
    }

    fn saturated(&self) -> QueueError {
        QueueError::Saturated {
            queued: self.len(),
            capacity: self.capacity,
        }
    }

    /// Admit a newly Ready task, shedding it if the queue is saturated.
    pub fn enqueue(&mut self, task: &Task) -> Result<(), QueueError> {
        self.enqueue_batch(&[task])
    }

    /// Admit several newly Ready tasks, or none of them.
    pub fn enqueue_batch(&mut self, tasks: &[&Task]) -> Result<(), QueueError> {
        if !self.can_admit(tasks.len()) {
            return Err(self.saturated());
        }
        for task in tasks {
            self.push_back(task);
        }
        Ok(())
    }

    /// Put a previously admitted task back in its priority position.
    ///
    /// Never shed. The task is placed among its tier by creation time so a
    /// retried task does not lose its place to younger work.
    pub fn requeue(&mut self, task: &Task) {
        if self.contains(&task.id) {
            return;
        }
        let entry = self.entry_for(task);
        self.insert_ordered(entry);
    }

    fn push_back(&mut self, task: &Task) {
        let entry = self.entry_for(task);
        self.tiers[task.priority.tier()].push_back(entry);
    }

    fn entry_for(&mut self, task: &Task) -> QueuedTask {
        self.next_seq += 1;
        QueuedTask {
            id: task.id.clone(),
            task_type: task.task_type.clone(),
            priority: task.priority,
            created_at: task.created_at,
            seq: self.next_seq,
        }
    }

    fn insert_ordered(&mut self, entry: QueuedTask) {
        let tier = &mut self.tiers[entry.priority.tier()];
        let key = entry.order_key();
        let pos = tier.partition_point(|q| q.order_key() <= key);
        tier.insert(pos, entry);
    }

    /// Restore an entry removed by a dequeue that could not be placed.
    pub fn restore(&mut self, entry: QueuedTask) {
        if !self.contains(&entry.id) {
            self.insert_ordered(entry);
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tiers.iter().flatten().any(|q| &q.id == id)
    }

    /// Pop the highest-priority, oldest task whose type appears in `capabilities`.
    pub fn dequeue_ready(&mut self, capabilities: &BTreeSet<String>) -> Option<QueuedTask> {
        self.dequeue_ready_excluding(capabilities, &HashSet::new())
    }

    /// Like [`dequeue_ready`](Self::dequeue_ready), skipping the ids in `skip`.
    pub fn dequeue_ready_excluding(
        &mut self,
        capabilities: &BTreeSet<String>,
        skip: &HashSet<TaskId>,
    ) -> Option<QueuedTask> {
        for tier in self.tiers.iter_mut() {
            let found = tier
                .iter()
                .position(|q| capabilities.contains(&q.task_type) && !skip.contains(&q.id));
            if let Some(pos) = found {
                return tier.remove(pos);
            }
        }
        None
    }

    /// Remove a task (e.g. on cancellation). Returns whether it was queued.
    pub fn remove(&mut self, id: &TaskId) -> bool {
        for tier in self.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(|q| &q.id == id) {
                tier.remove(pos);
                return true;
            }
        }
        false
    }

    /// Queue depth per priority, highest first.
    pub fn depth_by_priority(&self) -> Vec<(Priority, usize)> {
        Priority::DESCENDING
            .iter()
            .map(|p| (*p, self.tiers[p.tier()].len()))
            .collect()
    }

    /// Queue depth per task type.
    pub fn depth_by_type(&self) -> BTreeMap<String, usize> {
        let mut depths = BTreeMap::new();
        for q in self.tiers.iter().flatten() {
            *depths.entry(q.task_type.clone()).or_insert(0) += 1;
        }
        depths
    }
}
