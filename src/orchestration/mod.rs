//! Execution layer: worker pools and the cycle scheduler.
//!
//! Pools run task bodies on named OS threads; the scheduler decides what
//! runs when and collects completions from the pools over a channel.

pub mod pool;
pub mod scheduler;

pub use pool::{Job, PoolHandle, PoolRegistry};
pub use scheduler::{CycleReport, Scheduler, TaskFailure};
