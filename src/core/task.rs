//! Task data model for the dependency graph.
//!
//! A task is a named body bound to a pool, with a kind, an ordered list of
//! dependency names and optionally an owning module.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::context::Core;

/// What a task body returns. Any error type converts with `?`.
pub type TaskResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A task body. It receives the core it was registered with.
pub type TaskBody = Arc<dyn Fn(&Core) -> TaskResult + Send + Sync>;

/// How often a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Runs successfully once, then retires.
    Once,
    /// Runs every cycle.
    Repeated,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Once => write!(f, "once"),
            TaskKind::Repeated => write!(f, "repeated"),
        }
    }
}

/// Task state in its lifecycle.
///
/// Repeated tasks go Pending, Ready, Running, Completed and back to Pending
/// at the end of each cycle. Once tasks end at Retired or Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for dependencies or the next cycle.
    #[default]
    Pending,
    /// Dependencies satisfied; held back while its module reloads.
    Ready,
    /// Submitted to its pool.
    Running,
    /// Ran successfully this cycle.
    Completed,
    /// Body failed, or a dependency did.
    Failed,
    /// Never scheduled again; dependents treat it as satisfied.
    Retired,
}

impl TaskState {
    /// Completed and Retired satisfy a dependency.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Retired)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Retired => write!(f, "retired"),
        }
    }
}

/// Everything needed to register a task.
///
/// # Example
///
/// ```
/// use slate::core::{TaskKind, TaskSpec};
///
/// let spec = TaskSpec::new("integrate", "cpu", TaskKind::Repeated, |_core| Ok(()))
///     .depends_on(["collect_forces"])
///     .owned_by("physics");
/// assert_eq!(spec.dependencies(), ["collect_forces"]);
/// ```
#[derive(Clone)]
pub struct TaskSpec {
    pub(crate) name: String,
    pub(crate) pool: String,
    pub(crate) kind: TaskKind,
    pub(crate) body: TaskBody,
    pub(crate) dependencies: Vec<String>,
    pub(crate) module: Option<String>,
    pub(crate) retired: bool,
}

impl TaskSpec {
    pub fn new<F>(name: impl Into<String>, pool: impl Into<String>, kind: TaskKind, body: F) -> Self
    where
        F: Fn(&Core) -> TaskResult + Send + Sync + 'static,
    {
        Self::from_body(name, pool, kind, Arc::new(body))
    }

    pub fn from_body(
        name: impl Into<String>,
        pool: impl Into<String>,
        kind: TaskKind,
        body: TaskBody,
    ) -> Self {
        Self {
            name: name.into(),
            pool: pool.into(),
            kind,
            body,
            dependencies: Vec::new(),
            module: None,
            retired: false,
        }
    }

    pub fn once<F>(name: impl Into<String>, pool: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Core) -> TaskResult + Send + Sync + 'static,
    {
        Self::new(name, pool, TaskKind::Once, body)
    }

    pub fn repeated<F>(name: impl Into<String>, pool: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Core) -> TaskResult + Send + Sync + 'static,
    {
        Self::new(name, pool, TaskKind::Repeated, body)
    }

    /// Append dependency names. Order is kept; duplicates are ignored.
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.dependencies.contains(&name) {
                self.dependencies.push(name);
            }
        }
        self
    }

    /// Mark the task as supplied by a reloadable module.
    pub fn owned_by(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("kind", &self.kind)
            .field("dependencies", &self.dependencies)
            .field("module", &self.module)
            .finish()
    }
}

/// A task as held by the graph.
pub struct TaskNode {
    pub(crate) spec: TaskSpec,
    pub(crate) state: TaskState,
    /// Registration sequence; ties between ready tasks break on this.
    pub(crate) order: u64,
    /// Cycle this node last joined; a node participates in cycle `n` only
    /// if it was present when cycle `n` started.
    pub(crate) stamp: u64,
    pub(crate) runs: u64,
    pub(crate) retire_requested: bool,
    pub(crate) last_error: Option<String>,
}

impl TaskNode {
    pub(crate) fn new(spec: TaskSpec, order: u64) -> Self {
        let state = if spec.retired {
            TaskState::Retired
        } else {
            TaskState::Pending
        };
        Self {
            spec,
            state,
            order,
            stamp: 0,
            runs: 0,
            retire_requested: false,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn pool(&self) -> &str {
        &self.spec.pool
    }

    pub fn kind(&self) -> TaskKind {
        self.spec.kind
    }

    pub fn module(&self) -> Option<&str> {
        self.spec.module.as_deref()
    }

    pub fn dependencies(&self) -> &[String] {
        &self.spec.dependencies
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// How many times the body has been dispatched.
    pub fn run_count(&self) -> u64 {
        self.runs
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// A Once task that failed never runs again, so its dependents can
    /// never be satisfied.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            TaskState::Retired => true,
            TaskState::Failed => self.spec.kind == TaskKind::Once,
            _ => false,
        }
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.spec.name)
            .field("state", &self.state)
            .field("runs", &self.runs)
            .finish()
    }
}
