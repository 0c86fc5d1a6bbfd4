//! Reloadable modules.
//!
//! A module publishes a versioned [`Interface`] under a unique name and may
//! own tasks. The [`ModuleRegistry`] swaps bindings without tearing: see
//! [`ModuleRegistry::reload`] for the quiescence protocol.

pub mod registry;
pub mod version;

pub use registry::{InFlight, Interface, ModuleEvent, ModuleRegistry, ModuleState, OwnerScope};
pub use version::Version;

use crate::context::Core;
use crate::Result;

/// What a host hands the core to make a module loadable and reloadable.
///
/// `load` is called once by [`Core::load_module`] and again on every
/// [`Core::request_reload`]; each call produces a fresh binding.
pub trait ModuleSource: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self) -> Result<(Version, Interface)>;

    /// Register the module's tasks. Runs once, after the first load.
    fn register_tasks(&self, core: &Core) -> Result<()> {
        let _ = core;
        Ok(())
    }
}
