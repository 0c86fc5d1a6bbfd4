//! Task model and the dependency graph.
//!
//! Tasks are registered by name and wired together at finalize time; see
//! [`TaskGraph`] for the staging rules.

pub mod dag;
pub mod task;

pub use dag::TaskGraph;
pub use task::{TaskBody, TaskKind, TaskNode, TaskResult, TaskSpec, TaskState};
