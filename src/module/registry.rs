//! Module registry and the hot reload protocol.
//!
//! Each module owns one interface binding. Reload runs in three steps: the
//! module is marked Reloading so no new module-owned task body starts, the
//! caller waits until every body already started has returned, and the
//! binding is swapped under a write lock. Lookups take the read lock only
//! long enough to clone the binding's `Arc`, so a lookup sees the old
//! binding or the new one, never a mix.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use serde::Serialize;

use crate::module::Version;
use crate::util::{lock, read, write};
use crate::{Error, Result};

thread_local! {
    /// Module whose task body is running on this thread, if any.
    static RUNNING_OWNER: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// An opaque capability table published by a module.
///
/// Hosts and task bodies get at the concrete type through
/// [`ModuleRegistry::lookup_interface`].
#[derive(Clone)]
pub struct Interface(Arc<dyn Any + Send + Sync>);

impl Interface {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self(value)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Interface(..)")
    }
}

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Unloaded,
    Active,
    Reloading,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Unloaded => write!(f, "unloaded"),
            ModuleState::Active => write!(f, "active"),
            ModuleState::Reloading => write!(f, "reloading"),
        }
    }
}

/// Notifications published to [`ModuleRegistry::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleEvent {
    /// Dispatch of the module's tasks is paused.
    Reloading { name: String },
    /// The module is accepting dispatches again, at `version`.
    Activated { name: String, version: Version },
    Unloaded { name: String },
}

struct Gate {
    state: ModuleState,
    in_flight: usize,
}

struct ModuleEntry {
    name: String,
    binding: RwLock<(Version, Interface)>,
    gate: Mutex<Gate>,
    quiesced: Condvar,
    /// Serializes reload and unload of this module.
    exclusive: Mutex<()>,
}

/// Proof that one module-owned task instance is in flight.
///
/// Dropping it releases the instance from the module's quiescence count.
pub struct InFlight {
    entry: Arc<ModuleEntry>,
}

impl InFlight {
    pub fn module(&self) -> &str {
        &self.entry.name
    }

    /// Mark the current thread as running one of this module's task bodies
    /// until the returned scope is dropped.
    pub fn enter(&self) -> OwnerScope {
        let previous =
            RUNNING_OWNER.with(|cell| cell.borrow_mut().replace(self.entry.name.clone()));
        OwnerScope { previous }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut gate = lock(&self.entry.gate);
        gate.in_flight = gate.in_flight.saturating_sub(1);
        if gate.in_flight == 0 {
            self.entry.quiesced.notify_all();
        }
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("module", &self.entry.name)
            .finish()
    }
}

/// Restores the thread's previous owner marker on drop.
#[derive(Debug)]
pub struct OwnerScope {
    previous: Option<String>,
}

impl Drop for OwnerScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        RUNNING_OWNER.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// Named, versioned, reloadable interface bindings.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<ModuleEntry>>>,
    watchers: Mutex<Vec<Sender<ModuleEvent>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Result<Arc<ModuleEntry>> {
        read(&self.modules)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownModule(name.to_string()))
    }

    fn publish(&self, event: ModuleEvent) {
        lock(&self.watchers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Register a module in the Active state.
    pub fn register_module(&self, name: &str, version: Version, interface: Interface) -> Result<()> {
        let mut modules = write(&self.modules);
        if modules.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        modules.insert(
            name.to_string(),
            Arc::new(ModuleEntry {
                name: name.to_string(),
                binding: RwLock::new((version, interface)),
                gate: Mutex::new(Gate {
                    state: ModuleState::Active,
                    in_flight: 0,
                }),
                quiesced: Condvar::new(),
                exclusive: Mutex::new(()),
            }),
        );
        Ok(())
    }

    /// Lend the module's current binding to `f` as a `T`.
    ///
    /// The reference is only valid inside `f`; a reload that completes after
    /// `f` returns is visible to the next lookup.
    pub fn lookup_interface<T, R>(&self, name: &str, f: impl FnOnce(&T) -> R) -> Result<R>
    where
        T: Any,
    {
        let interface = self.snapshot(name)?;
        let typed = interface
            .downcast_ref::<T>()
            .ok_or_else(|| Error::InterfaceMismatch {
                module: name.to_string(),
                expected: type_name::<T>(),
            })?;
        Ok(f(typed))
    }

    /// Lend the untyped binding to `f`.
    pub fn with_interface<R>(&self, name: &str, f: impl FnOnce(&Interface) -> R) -> Result<R> {
        let interface = self.snapshot(name)?;
        Ok(f(&interface))
    }

    fn snapshot(&self, name: &str) -> Result<Interface> {
        let entry = self.entry(name)?;
        let binding = read(&entry.binding);
        Ok(binding.1.clone())
    }

    pub fn get_version(&self, name: &str) -> Result<Version> {
        let entry = self.entry(name)?;
        let version = read(&entry.binding).0;
        Ok(version)
    }

    /// `Unloaded` for names that are not registered.
    pub fn module_state(&self, name: &str) -> ModuleState {
        match self.entry(name) {
            Ok(entry) => lock(&entry.gate).state,
            Err(_) => ModuleState::Unloaded,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.modules).contains_key(name)
    }

    /// Registered module names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.modules).keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of module-owned task instances currently in flight.
    pub fn in_flight(&self, name: &str) -> Result<usize> {
        let entry = self.entry(name)?;
        let count = lock(&entry.gate).in_flight;
        Ok(count)
    }

    /// Admit one task body owned by `name`, right before it starts.
    ///
    /// Returns `None` while the module is reloading; the caller must hold the
    /// task back and retry once the module is announced Active again. Only
    /// admitted bodies count toward quiescence, so a reload never waits on
    /// work that is merely queued.
    pub fn acquire(&self, name: &str) -> Result<Option<InFlight>> {
        let entry = self.entry(name)?;
        let mut gate = lock(&entry.gate);
        if gate.state != ModuleState::Active {
            return Ok(None);
        }
        gate.in_flight += 1;
        drop(gate);
        Ok(Some(InFlight { entry }))
    }

    /// Swap in a new binding.
    ///
    /// Blocks until every in-flight instance of the module's tasks has
    /// returned. A version older than the current one is rejected before
    /// dispatch is paused, leaving the module Active on its old binding.
    pub fn reload(&self, name: &str, interface: Interface, version: Version) -> Result<()> {
        let entry = self.entry(name)?;

        let reentrant = RUNNING_OWNER.with(|cell| cell.borrow().as_deref() == Some(name));
        if reentrant {
            return Err(Error::InvalidArgument(format!(
                "module {} cannot be reloaded from one of its own tasks",
                name
            )));
        }

        let _exclusive = lock(&entry.exclusive);

        let current = read(&entry.binding).0;
        if version < current {
            return Err(Error::VersionRegression {
                module: name.to_string(),
                current,
                requested: version,
            });
        }

        lock(&entry.gate).state = ModuleState::Reloading;
        self.publish(ModuleEvent::Reloading {
            name: name.to_string(),
        });

        let mut gate = entry
            .quiesced
            .wait_while(lock(&entry.gate), |gate| gate.in_flight > 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        *write(&entry.binding) = (version, interface);
        gate.state = ModuleState::Active;
        drop(gate);

        self.publish(ModuleEvent::Activated {
            name: name.to_string(),
            version,
        });
        Ok(())
    }

    /// Remove a module. Fails with `ModuleBusy` while instances are in flight.
    pub fn unload(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let _exclusive = lock(&entry.exclusive);
        {
            let mut gate = lock(&entry.gate);
            if gate.in_flight > 0 {
                return Err(Error::ModuleBusy(name.to_string()));
            }
            gate.state = ModuleState::Unloaded;
        }
        write(&self.modules).remove(name);
        self.publish(ModuleEvent::Unloaded {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Drop every binding. Used at teardown.
    pub fn clear(&self) {
        let drained: Vec<String> = write(&self.modules).drain().map(|(name, _)| name).collect();
        for name in drained {
            self.publish(ModuleEvent::Unloaded { name });
        }
    }

    /// Receive every subsequent [`ModuleEvent`].
    pub fn subscribe(&self) -> Receiver<ModuleEvent> {
        let (tx, rx) = unbounded();
        lock(&self.watchers).push(tx);
        rx
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}
