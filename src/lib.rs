//! Slate: a task-graph scheduler over named thread pools, with a registry of
//! hot-reloadable modules.
//!
//! A host builds a [`Core`], adds pools, registers tasks (optionally owned by
//! modules), finalizes the graph and then drives it with
//! [`Core::run_cycle`]. Modules can be reloaded between or during cycles
//! without any task observing a half-swapped binding.

pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod log;
pub mod module;
pub mod orchestration;
pub mod util;

pub use context::{Core, CoreBuilder};
pub use error::{Error, Result};
