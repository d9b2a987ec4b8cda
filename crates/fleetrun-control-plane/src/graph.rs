//! Dependency graph resolver.
//!
//! Tasks live in an arena of nodes with adjacency lists in both directions.
//! Batches are validated as a whole before anything is inserted: unknown
//! dependencies, duplicate ids and cycles are rejected up front, so the graph
//! stored here is always acyclic and never needs re-checking on queries.

use std::collections::{HashMap, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use fleetrun_core::{CoreError, Task, TaskId};

struct Node {
    id: TaskId,
    task_type: String,
    complexity: f64,
    dependencies: Vec<usize>,
    dependents: Vec<usize>,
}

/// Longest dependency chain by estimated duration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CriticalPath {
    /// Task ids from the first task to run to the last.
    pub tasks: Vec<TaskId>,
    /// Sum of the weights along the path.
    pub total_weight: f64,
}

/// DAG of submitted tasks.
#[derive(Default)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<TaskId, usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check a batch against the graph without modifying it.
    ///
    /// Every dependency must either already be in the graph or be part of the
    /// batch. Existing nodes can never depend on new ones, so any cycle lies
    /// entirely within the batch.
    pub fn validate_batch(&self, batch: &[Task]) -> Result<(), CoreError> {
        let mut batch_ids: HashMap<&TaskId, usize> = HashMap::with_capacity(batch.len());
        for (pos, task) in batch.iter().enumerate() {
            if self.contains(&task.id) || batch_ids.insert(&task.id, pos).is_some() {
                return Err(CoreError::DuplicateTask(task.id.clone()));
            }
        }

        for task in batch {
            for dep in &task.dependencies {
                if !self.contains(dep) && !batch_ids.contains_key(dep) {
                    return Err(CoreError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = find_cycle(batch, &batch_ids) {
            return Err(CoreError::CyclicDependency(cycle));
        }
        Ok(())
    }

    /// Insert a batch previously accepted by [`validate_batch`](Self::validate_batch).
    pub fn insert_batch(&mut self, batch: &[Task]) {
        for task in batch {
            let idx = self.nodes.len();
            self.index.insert(task.id.clone(), idx);
            self.nodes.push(Node {
                id: task.id.clone(),
                task_type: task.task_type.clone(),
                complexity: task.estimated_complexity,
                dependencies: Vec::new(),
                dependents: Vec::new(),
            });
        }
        for task in batch {
            let idx = self.index[&task.id];
            for dep in &task.dependencies {
                // Dependencies on ids the graph never saw are resolved by the
                // caller against the task store.
                if let Some(&dep_idx) = self.index.get(dep) {
                    self.nodes[idx].dependencies.push(dep_idx);
                    self.nodes[dep_idx].dependents.push(idx);
                }
            }
        }
    }

    /// Direct dependents of a task.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.index
            .get(id)
            .map(|&idx| {
                self.nodes[idx]
                    .dependents
                    .iter()
                    .map(|&d| self.nodes[d].id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Longest path through the tasks selected by `weight`.
    ///
    /// `weight` receives a task's id, type and estimated complexity and returns
    /// its estimated duration, or `None` to leave the task out (e.g. tasks that
    /// already finished).
    pub fn critical_path<F>(&self, weight: F) -> CriticalPath
    where
        F: Fn(&TaskId, &str, f64) -> Option<f64>,
    {
        let weights: Vec<Option<f64>> = self
            .nodes
            .iter()
            .map(|n| weight(&n.id, &n.task_type, n.complexity))
            .collect();

        let mut best: Vec<f64> = vec![0.0; self.nodes.len()];
        let mut prev: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut end: Option<usize> = None;

        for idx in self.topological_order() {
            let Some(w) = weights[idx] else { continue };
            let mut base = 0.0;
            for &dep in &self.nodes[idx].dependencies {
                if weights[dep].is_some() && best[dep] > base {
                    base = best[dep];
                    prev[idx] = Some(dep);
                }
            }
            best[idx] = base + w;
            if end.map_or(true, |e| best[idx] > best[e]) {
                end = Some(idx);
            }
        }

        let Some(end) = end else {
            return CriticalPath::default();
        };

        let mut tasks = Vec::new();
        let mut cursor = Some(end);
        while let Some(idx) = cursor {
            tasks.push(self.nodes[idx].id.clone());
            cursor = prev[idx];
        }
        tasks.reverse();

        CriticalPath {
            tasks,
            total_weight: best[end],
        }
    }

    /// Kahn's algorithm over the whole arena.
    fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(idx, _)| idx)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(idx) = ready.pop_front() {
            order.push(idx);
            for &dependent in &self.nodes[idx].dependents {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }
        order
    }
}

/// Cycle within the batch's internal edges, as a path that starts and ends at
/// the same task.
///
/// Edges point from a task to the batch members it depends on. Both the
/// topological sort and the path search are iterative, so chain depth is
/// bounded by memory rather than by the stack.
fn find_cycle(batch: &[Task], batch_ids: &HashMap<&TaskId, usize>) -> Option<Vec<TaskId>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(batch.len(), batch.len());
    let nodes: Vec<NodeIndex> = (0..batch.len()).map(|pos| graph.add_node(pos)).collect();
    for (pos, task) in batch.iter().enumerate() {
        for dep in &task.dependencies {
            if let Some(&dep_pos) = batch_ids.get(dep) {
                graph.add_edge(nodes[pos], nodes[dep_pos], ());
            }
        }
    }

    let start = match toposort(&graph, None) {
        Ok(_) => return None,
        Err(cycle) => cycle.node_id(),
    };

    // Breadth-first walk back to the node the sort tripped on.
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut frontier = VecDeque::from([start]);
    while let Some(node) = frontier.pop_front() {
        for next in graph.neighbors(node) {
            if next == start {
                let mut path = vec![node];
                let mut cursor = node;
                while cursor != start {
                    let Some(&up) = parent.get(&cursor) else { break };
                    path.push(up);
                    cursor = up;
                }
                path.reverse();
                path.push(start);
                return Some(path.into_iter().map(|n| batch[graph[n]].id.clone()).collect());
            }
            if !parent.contains_key(&next) {
                parent.insert(next, node);
                frontier.push_back(next);
            }
        }
    }
    Some(vec![batch[graph[start]].id.clone()])
}
