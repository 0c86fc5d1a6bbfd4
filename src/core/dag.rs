//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! Tasks are staged by name and only wired into the graph by
//! [`TaskGraph::finalize`], so a task may name a dependency that is
//! registered later (by another module, for instance). Edges point from a
//! dependency to its dependent.

use crate::core::task::{TaskNode, TaskSpec, TaskState};
use crate::error::{Error, Result};
use petgraph::algo::tarjan_scc;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// The task dependency graph.
///
/// Uses a `StableDiGraph` so node indices held by an in-progress cycle
/// survive removal of unrelated tasks.
pub struct TaskGraph {
    graph: StableDiGraph<TaskNode, ()>,
    index: HashMap<String, NodeIndex>,
    staged: Vec<TaskSpec>,
    next_order: u64,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            staged: Vec::new(),
            next_order: 0,
        }
    }

    /// True if `name` is finalized or staged.
    pub fn is_known(&self, name: &str) -> bool {
        self.index.contains_key(name) || self.staged.iter().any(|s| s.name == name)
    }

    /// Stage a task for the next [`finalize`](Self::finalize).
    ///
    /// # Errors
    /// `DuplicateName` if a finalized or staged task already uses the name.
    pub fn stage(&mut self, spec: TaskSpec) -> Result<()> {
        if self.is_known(&spec.name) {
            return Err(Error::DuplicateName(spec.name));
        }
        self.staged.push(spec);
        Ok(())
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Drop every staged task. Returns how many were dropped.
    pub fn discard_staged(&mut self) -> usize {
        let count = self.staged.len();
        self.staged.clear();
        count
    }

    /// Wire the staged batch into the graph.
    ///
    /// Returns the number of tasks added.
    ///
    /// # Errors
    /// - `UnknownDependency` if a staged task names a task that is neither
    ///   finalized nor staged. The batch stays staged.
    /// - `CyclicDependency` if the batch closes a cycle. The batch is
    ///   discarded and the finalized graph is unchanged.
    pub fn finalize(&mut self) -> Result<usize> {
        if self.staged.is_empty() {
            return Ok(0);
        }

        let staged_names: HashSet<&str> = self.staged.iter().map(|s| s.name.as_str()).collect();
        for spec in &self.staged {
            for dep in &spec.dependencies {
                if !self.index.contains_key(dep) && !staged_names.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        task: spec.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let batch = std::mem::take(&mut self.staged);
        let mut added: HashMap<String, NodeIndex> = HashMap::with_capacity(batch.len());
        for spec in batch {
            let name = spec.name.clone();
            let node = TaskNode::new(spec, self.next_order);
            self.next_order += 1;
            added.insert(name, self.graph.add_node(node));
        }

        for &to in added.values() {
            let deps = self.graph[to].spec.dependencies.clone();
            for dep in deps {
                let from = self
                    .index
                    .get(&dep)
                    .or_else(|| added.get(&dep))
                    .copied()
                    .ok_or_else(|| Error::UnknownTask(dep.clone()))?;
                self.graph.add_edge(from, to, ());
            }
        }

        if let Some(cycle) = self.find_cycle() {
            for &node in added.values() {
                self.graph.remove_node(node);
            }
            return Err(Error::CyclicDependency { cycle });
        }

        let count = added.len();
        self.index.extend(added);
        Ok(count)
    }

    /// One cycle in the graph, as names in edge order with the first name
    /// repeated at the end.
    fn find_cycle(&self) -> Option<Vec<String>> {
        for component in tarjan_scc(&self.graph) {
            let start = match component.as_slice() {
                [single] if self.graph.contains_edge(*single, *single) => *single,
                [_] => continue,
                nodes => *nodes
                    .iter()
                    .min_by_key(|&&n| self.graph[n].order)
                    .unwrap_or(&nodes[0]),
            };
            let members: HashSet<NodeIndex> = component.iter().copied().collect();
            if let Some(path) = self.path_back_to(start, &members) {
                let mut names: Vec<String> =
                    path.iter().map(|&n| self.graph[n].spec.name.clone()).collect();
                names.push(self.graph[start].spec.name.clone());
                return Some(names);
            }
        }
        None
    }

    /// Depth-first walk inside one strongly connected component from
    /// `start` until an edge leads back to it.
    fn path_back_to(&self, start: NodeIndex, members: &HashSet<NodeIndex>) -> Option<Vec<NodeIndex>> {
        let mut path = vec![start];
        let mut visited = HashSet::from([start]);
        let mut stack = vec![self.sorted_neighbors(start, Direction::Outgoing)];

        while let Some(frontier) = stack.last_mut() {
            match frontier.pop() {
                Some(next) if next == start => return Some(path),
                Some(next) if members.contains(&next) && visited.insert(next) => {
                    path.push(next);
                    stack.push(self.sorted_neighbors(next, Direction::Outgoing));
                }
                Some(_) => {}
                None => {
                    stack.pop();
                    path.pop();
                }
            }
        }
        None
    }

    /// Neighbors with the earliest registered last, ready for `pop`.
    fn sorted_neighbors(&self, node: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(node, dir).collect();
        neighbors.sort_by_key(|&n| std::cmp::Reverse(self.graph[n].order));
        neighbors.dedup();
        neighbors
    }

    /// Get a finalized task by name.
    pub fn get(&self, name: &str) -> Option<&TaskNode> {
        self.index.get(name).map(|&i| &self.graph[i])
    }

    pub fn state(&self, name: &str) -> Result<TaskState> {
        self.get(name)
            .map(|n| n.state)
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    /// Finalized task names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.indices_in_order()
            .into_iter()
            .map(|i| self.graph[i].spec.name.clone())
            .collect()
    }

    /// Names of tasks that directly depend on `name`, in registration order.
    pub fn dependents(&self, name: &str) -> Result<Vec<String>> {
        let index = *self
            .index
            .get(name)
            .ok_or_else(|| Error::UnknownTask(name.to_string()))?;
        let mut dependents = self.sorted_neighbors(index, Direction::Outgoing);
        dependents.reverse();
        Ok(dependents
            .into_iter()
            .map(|i| self.graph[i].spec.name.clone())
            .collect())
    }

    /// Finalized and staged tasks owned by `module`.
    pub fn owned_by(&self, module: &str) -> Vec<String> {
        let mut owned: Vec<String> = self
            .indices_in_order()
            .into_iter()
            .map(|i| &self.graph[i].spec)
            .chain(self.staged.iter())
            .filter(|spec| spec.module.as_deref() == Some(module))
            .map(|spec| spec.name.clone())
            .collect();
        owned.dedup();
        owned
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0 && self.staged.is_empty()
    }

    /// Stop scheduling `name`. Its dependents treat it as satisfied.
    ///
    /// A running task retires when its current run finishes. A staged task
    /// enters the graph already retired.
    pub fn retire(&mut self, name: &str) -> Result<()> {
        if let Some(spec) = self.staged.iter_mut().find(|s| s.name == name) {
            spec.retired = true;
            return Ok(());
        }
        let index = *self
            .index
            .get(name)
            .ok_or_else(|| Error::UnknownTask(name.to_string()))?;
        let node = &mut self.graph[index];
        if node.state == TaskState::Running {
            node.retire_requested = true;
        } else {
            node.state = TaskState::Retired;
        }
        Ok(())
    }

    /// Remove `name` from the graph.
    ///
    /// # Errors
    /// - `HasDependents` if any non-terminal task, finalized or staged,
    ///   depends on it.
    /// - `TaskRunning` if it is mid-flight.
    pub fn unregister(&mut self, name: &str) -> Result<()> {
        let staged_dependents: Vec<String> = self
            .staged
            .iter()
            .filter(|s| s.dependencies.iter().any(|d| d == name))
            .map(|s| s.name.clone())
            .collect();

        if let Some(pos) = self.staged.iter().position(|s| s.name == name) {
            if !staged_dependents.is_empty() {
                return Err(Error::HasDependents {
                    task: name.to_string(),
                    dependents: staged_dependents,
                });
            }
            self.staged.remove(pos);
            return Ok(());
        }

        let index = *self
            .index
            .get(name)
            .ok_or_else(|| Error::UnknownTask(name.to_string()))?;

        if self.graph[index].state == TaskState::Running {
            return Err(Error::TaskRunning(name.to_string()));
        }

        let mut live: Vec<String> = self
            .sorted_neighbors(index, Direction::Outgoing)
            .into_iter()
            .rev()
            .filter(|&i| !self.graph[i].is_terminal())
            .map(|i| self.graph[i].spec.name.clone())
            .collect();
        live.extend(staged_dependents);
        if !live.is_empty() {
            return Err(Error::HasDependents {
                task: name.to_string(),
                dependents: live,
            });
        }

        self.graph.remove_node(index);
        self.index.remove(name);
        Ok(())
    }

    // ========== Scheduling access ==========

    /// Node indices sorted by registration order.
    pub(crate) fn indices_in_order(&self) -> Vec<NodeIndex> {
        let mut indices: Vec<NodeIndex> = self.graph.node_indices().collect();
        indices.sort_by_key(|&i| self.graph[i].order);
        indices
    }

    pub(crate) fn node(&self, index: NodeIndex) -> Option<&TaskNode> {
        self.graph.node_weight(index)
    }

    pub(crate) fn node_mut(&mut self, index: NodeIndex) -> Option<&mut TaskNode> {
        self.graph.node_weight_mut(index)
    }

    /// Direct dependencies of a node.
    pub(crate) fn dependencies_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .collect()
    }

    /// Direct dependents of a node, earliest registered first.
    pub(crate) fn dependents_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut dependents = self.sorted_neighbors(index, Direction::Outgoing);
        dependents.reverse();
        dependents
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("staged", &self.staged_count())
            .finish()
    }
}
