//! The core context.
//!
//! A [`Core`] owns the pool registry, the task scheduler and the module
//! registry, plus handles to the host's config and log collaborators. One is
//! built per host with [`CoreBuilder`] and handed to every task body as
//! `&Core`. Teardown is explicit: [`Core::shutdown`] drains the pools and
//! releases every module binding, and runs on drop if the host never calls
//! it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{ConfigStore, MemoryConfig};
use crate::core::{TaskKind, TaskSpec, TaskState};
use crate::log::{LogSink, NullLog};
use crate::module::{Interface, ModuleRegistry, ModuleSource, ModuleState, Version};
use crate::orchestration::{CycleReport, PoolRegistry, Scheduler};
use crate::util::lock;
use crate::{slog_debug, slog_error, slog_info, slog_warn, Error, Result};

/// Builds a [`Core`].
///
/// Without explicit collaborators the core uses an empty [`MemoryConfig`]
/// and discards log output.
#[derive(Default)]
pub struct CoreBuilder {
    config: Option<Arc<dyn ConfigStore>>,
    log: Option<Arc<dyn LogSink>>,
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(self, config: impl ConfigStore + 'static) -> Self {
        self.config_arc(Arc::new(config))
    }

    pub fn config_arc(mut self, config: Arc<dyn ConfigStore>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn log(self, log: impl LogSink + 'static) -> Self {
        self.log_arc(Arc::new(log))
    }

    pub fn log_arc(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> Arc<Core> {
        let modules = ModuleRegistry::new();
        let scheduler = Scheduler::new(&modules);
        Arc::new(Core {
            pools: PoolRegistry::new(),
            scheduler,
            modules,
            sources: Mutex::new(HashMap::new()),
            config: self
                .config
                .unwrap_or_else(|| Arc::new(MemoryConfig::new())),
            log: self.log.unwrap_or_else(|| Arc::new(NullLog)),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Explicitly constructed engine state shared by hosts and task bodies.
pub struct Core {
    pools: PoolRegistry,
    scheduler: Scheduler,
    modules: ModuleRegistry,
    sources: Mutex<HashMap<String, Arc<dyn ModuleSource>>>,
    config: Arc<dyn ConfigStore>,
    log: Arc<dyn LogSink>,
    shut_down: AtomicBool,
}

impl Core {
    /// A core with default collaborators.
    pub fn new() -> Arc<Self> {
        CoreBuilder::new().build()
    }

    pub fn builder() -> CoreBuilder {
        CoreBuilder::new()
    }

    pub fn config(&self) -> &dyn ConfigStore {
        self.config.as_ref()
    }

    pub fn log(&self) -> &dyn LogSink {
        self.log.as_ref()
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::InvalidArgument("core is shut down".to_string()));
        }
        Ok(())
    }

    // ========== Pools ==========

    pub fn add_pool(&self, name: &str, threads: u32) -> Result<()> {
        self.ensure_running()?;
        self.pools.create_pool(name, threads)?;
        slog_info!(self.log(), "pool {} started with {} threads", name, threads);
        Ok(())
    }

    // ========== Tasks ==========

    /// Stage a task for the next [`finalize`](Self::finalize).
    ///
    /// # Errors
    /// `DuplicateName`, `UnknownPool`, or `UnknownModule` when the task
    /// names an owning module that is not registered. Dependencies are
    /// resolved at finalize time.
    pub fn register_task(&self, spec: TaskSpec) -> Result<()> {
        self.ensure_running()?;
        if !self.pools.contains(spec.pool()) {
            return Err(Error::UnknownPool(spec.pool().to_string()));
        }
        let name = spec.name().to_string();
        self.scheduler.stage(spec, &self.modules)?;
        slog_debug!(self.log(), "task {} staged", name);
        Ok(())
    }

    pub fn add_task<F>(
        &self,
        name: &str,
        pool: &str,
        body: F,
        kind: TaskKind,
        dependencies: &[&str],
    ) -> Result<()>
    where
        F: Fn(&Core) -> crate::core::TaskResult + Send + Sync + 'static,
    {
        self.register_task(
            TaskSpec::new(name, pool, kind, body).depends_on(dependencies.iter().copied()),
        )
    }

    pub fn add_once<F>(&self, name: &str, pool: &str, dependencies: &[&str], body: F) -> Result<()>
    where
        F: Fn(&Core) -> crate::core::TaskResult + Send + Sync + 'static,
    {
        self.add_task(name, pool, body, TaskKind::Once, dependencies)
    }

    pub fn add_repeated<F>(
        &self,
        name: &str,
        pool: &str,
        dependencies: &[&str],
        body: F,
    ) -> Result<()>
    where
        F: Fn(&Core) -> crate::core::TaskResult + Send + Sync + 'static,
    {
        self.add_task(name, pool, body, TaskKind::Repeated, dependencies)
    }

    /// Resolve and validate every staged task. Returns how many joined.
    pub fn finalize(&self) -> Result<usize> {
        match self.scheduler.finalize() {
            Ok(0) => Ok(0),
            Ok(count) => {
                slog_info!(self.log(), "finalized {} tasks", count);
                Ok(count)
            }
            Err(e) => {
                slog_warn!(self.log(), "finalize rejected: {}", e);
                Err(e)
            }
        }
    }

    pub fn discard_staged(&self) -> usize {
        self.scheduler.discard_staged()
    }

    /// Run one scheduling cycle; see [`Scheduler::run_cycle`].
    pub fn run_cycle(self: &Arc<Self>) -> Result<CycleReport> {
        self.ensure_running()?;
        self.scheduler.run_cycle(self)
    }

    pub fn retire_task(&self, name: &str) -> Result<()> {
        self.scheduler.retire_task(name)?;
        slog_debug!(self.log(), "task {} retired", name);
        Ok(())
    }

    pub fn unregister_task(&self, name: &str) -> Result<()> {
        self.scheduler.unregister_task(name)?;
        slog_debug!(self.log(), "task {} unregistered", name);
        Ok(())
    }

    pub fn task_state(&self, name: &str) -> Result<TaskState> {
        self.scheduler.task_state(name)
    }

    pub fn task_names(&self) -> Vec<String> {
        self.scheduler.task_names()
    }

    pub fn run_count(&self, name: &str) -> Result<u64> {
        self.scheduler.run_count(name)
    }

    pub fn dependents(&self, name: &str) -> Result<Vec<String>> {
        self.scheduler.dependents(name)
    }

    pub fn cycle_count(&self) -> u64 {
        self.scheduler.cycle_count()
    }

    // ========== Modules ==========

    pub fn register_module(&self, name: &str, version: Version, interface: Interface) -> Result<()> {
        self.ensure_running()?;
        self.modules.register_module(name, version, interface)?;
        slog_info!(self.log(), "module {} {} active", name, version);
        Ok(())
    }

    /// Load a module from its source and register its tasks.
    ///
    /// If task registration fails, the tasks registered so far are removed
    /// and the module is unloaded again.
    ///
    /// # Errors
    /// The registration error, or `RollbackIncomplete` when some of the
    /// module's tasks are depended on and could not be removed.
    pub fn load_module(&self, source: Arc<dyn ModuleSource>) -> Result<()> {
        let name = source.name().to_string();
        if self.modules.contains(&name) {
            return Err(Error::DuplicateName(name));
        }
        let (version, interface) = source.load().map_err(|e| load_failed(&name, e))?;
        self.register_module(&name, version, interface)?;
        lock(&self.sources).insert(name.clone(), Arc::clone(&source));

        if let Err(e) = source.register_tasks(self) {
            slog_error!(self.log(), "module {} failed to register tasks: {}", name, e);
            return Err(self.roll_back_load(&name, e));
        }
        Ok(())
    }

    /// Undo a partial [`load_module`](Self::load_module).
    ///
    /// Tasks that other tasks already depend on cannot be removed. If any
    /// survive, the module stays registered so they keep a live owner, and
    /// the error names them.
    fn roll_back_load(&self, name: &str, cause: Error) -> Error {
        let mut remaining: Vec<String> = self.scheduler.tasks_owned_by(name);
        remaining.reverse();
        loop {
            let before = remaining.len();
            remaining.retain(|task| self.scheduler.unregister_task(task).is_err());
            if remaining.is_empty() || remaining.len() == before {
                break;
            }
        }

        if !remaining.is_empty() {
            slog_warn!(
                self.log(),
                "module {} stays loaded: {} still registered",
                name,
                remaining.join(", ")
            );
            return Error::RollbackIncomplete {
                module: name.to_string(),
                cause: Box::new(cause),
                remaining,
            };
        }

        lock(&self.sources).remove(name);
        if let Err(e) = self.scheduler.unload_module(name, &self.modules) {
            slog_warn!(self.log(), "module {} could not be unloaded: {}", name, e);
        }
        cause
    }

    /// Lend the typed binding of `name` to `f`.
    pub fn lookup_interface<T, R>(&self, name: &str, f: impl FnOnce(&T) -> R) -> Result<R>
    where
        T: std::any::Any,
    {
        self.modules.lookup_interface(name, f)
    }

    /// Lend the untyped binding of `name` to `f`.
    pub fn get_interface<R>(&self, name: &str, f: impl FnOnce(&Interface) -> R) -> Result<R> {
        self.modules.with_interface(name, f)
    }

    pub fn get_version(&self, name: &str) -> Result<Version> {
        self.modules.get_version(name)
    }

    pub fn module_state(&self, name: &str) -> ModuleState {
        self.modules.module_state(name)
    }

    /// Swap in a new binding; see [`ModuleRegistry::reload`].
    pub fn reload_module(&self, name: &str, interface: Interface, version: Version) -> Result<()> {
        let previous = self.modules.get_version(name)?;
        match self.modules.reload(name, interface, version) {
            Ok(()) => {
                slog_info!(self.log(), "module {} reloaded: {} -> {}", name, previous, version);
                Ok(())
            }
            Err(e) => {
                slog_warn!(self.log(), "module {} reload rejected: {}", name, e);
                Err(e)
            }
        }
    }

    /// Ask the module's source for a fresh binding and reload to it.
    ///
    /// # Errors
    /// - `UnknownModule` if `name` is not registered.
    /// - `InvalidArgument` if the module was registered without a source.
    /// - `LoadFailed` if the source cannot produce a binding; the current
    ///   binding stays active.
    pub fn request_reload(&self, name: &str) -> Result<()> {
        if !self.modules.contains(name) {
            return Err(Error::UnknownModule(name.to_string()));
        }
        let source = lock(&self.sources).get(name).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!("module {} has no source to reload from", name))
        })?;
        let (version, interface) = match source.load() {
            Ok(binding) => binding,
            Err(e) => {
                let err = load_failed(name, e);
                slog_error!(self.log(), "{}", err);
                return Err(err);
            }
        };
        self.reload_module(name, interface, version)
    }

    /// Remove a module.
    ///
    /// # Errors
    /// `ModuleBusy` while any task, finalized or staged, is registered
    /// against the module, or one of its task instances is in flight.
    pub fn unload_module(&self, name: &str) -> Result<()> {
        if !self.modules.contains(name) {
            return Err(Error::UnknownModule(name.to_string()));
        }
        self.scheduler.unload_module(name, &self.modules)?;
        lock(&self.sources).remove(name);
        slog_info!(self.log(), "module {} unloaded", name);
        Ok(())
    }

    // ========== Teardown ==========

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Drain and join every pool, then release every module binding.
    /// Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pools.shutdown_all();
        lock(&self.sources).clear();
        self.modules.clear();
        slog_info!(self.log(), "core shut down");
    }
}

fn load_failed(module: &str, err: Error) -> Error {
    match err {
        Error::LoadFailed { .. } => err,
        other => Error::LoadFailed {
            module: module.to_string(),
            reason: other.to_string(),
        },
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("pools", &self.pools)
            .field("modules", &self.modules)
            .field("scheduler", &self.scheduler)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
