//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! This module provides the TaskDAG structure that represents the
//! dependencies between the transfer tasks of one campaign, enabling
//! parallel execution of independent branches.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;

use crate::core::ids::TaskId;
use crate::core::task::{Task, TaskStatus};
use crate::error::{Error, Result};

/// The task dependency graph.
///
/// TaskDAG uses petgraph's DiGraph to represent task dependencies.
/// Nodes are tasks, and an edge `a -> b` means `b` may only start once
/// `a` is processed.
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build the DAG from a campaign's tasks using each task's
    /// `depends_on` list.
    ///
    /// # Errors
    /// Returns an error if:
    /// - A dependency refers to a task outside the set
    /// - A dependency does not precede its dependent in `sort_id` order
    /// - The dependencies contain a cycle
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            dag.add_task(task);
        }

        let mut edges = Vec::new();
        for index in dag.graph.node_indices() {
            let task = &dag.graph[index];
            for dep in &task.depends_on {
                let dep_index = dag.task_index.get(dep).copied().ok_or_else(|| {
                    Error::Validation(format!(
                        "Task {} depends on unknown task {}",
                        task.id, dep
                    ))
                })?;
                if dag.graph[dep_index].sort_id >= task.sort_id {
                    return Err(Error::Validation(format!(
                        "Task {} (sort {}) depends on later task {} (sort {})",
                        task.id, task.sort_id, dep, dag.graph[dep_index].sort_id
                    )));
                }
                edges.push((dep_index, index));
            }
        }
        for (from, to) in edges {
            dag.graph.add_edge(from, to, ());
        }

        dag.topological_order()?;
        Ok(dag)
    }

    /// Add a task, returning its index. A task already present keeps its
    /// existing index.
    fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    /// Replace the stored copy of a task with a newer record.
    pub fn update_task(&mut self, task: Task) -> Result<()> {
        let slot = self
            .get_task_mut(&task.id)
            .ok_or_else(|| Error::TaskNotFound(task.id))?;
        *slot = task;
        Ok(())
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get all tasks that depend on the given task (successors).
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(index, Direction::Outgoing)
            .filter_map(|neighbor| self.graph.node_weight(neighbor))
            .collect()
    }

    // ========== Scheduling Operations ==========

    /// Get all tasks ready to execute, ordered by `sort_id`.
    ///
    /// A task is ready if it is `Unprocessed` and every task it depends on
    /// is `Processed`. Tasks in `skip` (already claimed in this run) are
    /// left out.
    pub fn ready_tasks<'a>(&'a self, skip: &HashSet<TaskId>) -> Vec<&'a Task> {
        let mut ready: Vec<&Task> = self
            .graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if task.status != TaskStatus::Unprocessed || skip.contains(&task.id) {
                    return None;
                }

                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep_index| self.graph[dep_index].status == TaskStatus::Processed);

                deps_satisfied.then_some(task)
            })
            .collect();
        ready.sort_by_key(|t| t.sort_id);
        ready
    }

    /// Tasks that cannot run because some ancestor is `Failed`.
    pub fn blocked_by_failures(&self) -> HashSet<TaskId> {
        let mut blocked = HashSet::new();
        for index in self.graph.node_indices() {
            if self.graph[index].status != TaskStatus::Failed {
                continue;
            }
            let mut dfs = Dfs::new(&self.graph, index);
            while let Some(next) = dfs.next(&self.graph) {
                if next != index {
                    blocked.insert(self.graph[next].id);
                }
            }
        }
        blocked
    }

    /// Count tasks in the given status.
    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.graph
            .node_weights()
            .filter(|t| t.status == status)
            .count()
    }

    /// Get tasks in topological order (respecting dependencies).
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle.
    fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let task_id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Validation(format!("Cycle detected at task: {}", task_id))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
