//! Cycle scheduler.
//!
//! One caller drives a cycle. The scheduler dispatches every participating
//! task whose dependencies are satisfied, in registration order, then sleeps
//! on a channel of completion events fed by pool workers. A task unblocked
//! by a completion is dispatched as soon as that completion is handled, so a
//! cycle is a wavefront rather than a sequence of barriers.
//!
//! The graph lock is never held while the coordinator waits, so task bodies
//! may register, retire or inspect tasks while a cycle runs. Tasks finalized
//! during a cycle join the next one.

use std::cell::Cell;
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use petgraph::stable_graph::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::context::Core;
use crate::core::{TaskBody, TaskGraph, TaskKind, TaskSpec, TaskState};
use crate::module::{InFlight, ModuleEvent, ModuleRegistry, ModuleState};
use crate::orchestration::pool::Job;
use crate::util::{lock, panic_message};
use crate::{slog_debug, slog_error, slog_verbose, slog_warn, Error, Result};

thread_local! {
    static IN_TASK_BODY: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a task body.
struct BodyScope {
    previous: bool,
}

impl BodyScope {
    fn enter() -> Self {
        Self {
            previous: IN_TASK_BODY.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for BodyScope {
    fn drop(&mut self) {
        let previous = self.previous;
        IN_TASK_BODY.with(|flag| flag.set(previous));
    }
}

/// One originally failing task and why it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task: String,
    pub cause: String,
}

impl From<TaskFailure> for Error {
    fn from(failure: TaskFailure) -> Self {
        Error::TaskFailure {
            task: failure.task,
            cause: failure.cause,
        }
    }
}

/// Outcome of one [`Scheduler::run_cycle`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// 1-based cycle number.
    pub cycle: u64,
    /// Tasks that ran successfully, in completion order.
    pub completed: Vec<String>,
    /// One entry per task whose own body failed.
    pub failed: Vec<TaskFailure>,
    /// Tasks marked Failed without running because a dependency failed.
    pub skipped: Vec<String>,
}

impl CycleReport {
    fn new(cycle: u64) -> Self {
        Self {
            cycle,
            ..Self::default()
        }
    }

    /// No task failed or was skipped.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn ran(&self, task: &str) -> bool {
        self.completed.iter().any(|t| t == task) || self.failure(task).is_some()
    }

    pub fn failure(&self, task: &str) -> Option<&TaskFailure> {
        self.failed.iter().find(|f| f.task == task)
    }

    pub fn was_skipped(&self, task: &str) -> bool {
        self.skipped.iter().any(|t| t == task)
    }

    /// The first failure as an error, if any.
    pub fn into_result(self) -> Result<Self> {
        match self.failed.first() {
            Some(failure) => Err(failure.clone().into()),
            None => Ok(self),
        }
    }
}

/// What a pool worker reports back for one dispatched task.
enum Outcome {
    Done,
    Failed(String),
    /// The owning module started reloading before the body could start.
    Held,
}

/// Sent by a pool worker when a task body returns or is held.
struct Completion {
    node: NodeIndex,
    outcome: Outcome,
}

/// Receivers only the cycle driver reads. Holding this lock is what
/// serializes concurrent `run_cycle` callers.
struct Driver {
    completions: Receiver<Completion>,
    modules: Receiver<ModuleEvent>,
}

/// Bookkeeping for the cycle in progress.
struct CycleRun {
    cycle: u64,
    report: CycleReport,
    skipped: HashSet<NodeIndex>,
    running: usize,
}

/// Owns the task graph and runs cycles over it.
pub struct Scheduler {
    graph: Mutex<TaskGraph>,
    driver: Mutex<Driver>,
    completions_tx: Sender<Completion>,
    cycles: AtomicU64,
}

impl Scheduler {
    /// Create a scheduler that wakes held tasks on `modules` events.
    pub fn new(modules: &ModuleRegistry) -> Self {
        let (completions_tx, completions) = unbounded();
        Self {
            graph: Mutex::new(TaskGraph::new()),
            driver: Mutex::new(Driver {
                completions,
                modules: modules.subscribe(),
            }),
            completions_tx,
            cycles: AtomicU64::new(0),
        }
    }

    // ========== Registration ==========

    /// Stage a task. Its owning module, if any, is checked under the graph
    /// lock, so it cannot be unloaded between the check and the staging.
    pub fn stage(&self, spec: TaskSpec, modules: &ModuleRegistry) -> Result<()> {
        let mut graph = lock(&self.graph);
        if let Some(module) = spec.module.as_deref() {
            if !modules.contains(module) {
                return Err(Error::UnknownModule(module.to_string()));
            }
        }
        graph.stage(spec)
    }

    pub fn finalize(&self) -> Result<usize> {
        lock(&self.graph).finalize()
    }

    pub fn discard_staged(&self) -> usize {
        lock(&self.graph).discard_staged()
    }

    pub fn staged_count(&self) -> usize {
        lock(&self.graph).staged_count()
    }

    pub fn retire_task(&self, name: &str) -> Result<()> {
        lock(&self.graph).retire(name)
    }

    pub fn unregister_task(&self, name: &str) -> Result<()> {
        lock(&self.graph).unregister(name)
    }

    // ========== Inspection ==========

    pub fn task_state(&self, name: &str) -> Result<TaskState> {
        lock(&self.graph).state(name)
    }

    /// Finalized task names in registration order.
    pub fn task_names(&self) -> Vec<String> {
        lock(&self.graph).names()
    }

    pub fn task_count(&self) -> usize {
        lock(&self.graph).task_count()
    }

    /// How many times the task's body has been dispatched.
    pub fn run_count(&self, name: &str) -> Result<u64> {
        let graph = lock(&self.graph);
        graph
            .get(name)
            .map(|n| n.run_count())
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    /// Failure cause recorded the last time the task failed.
    pub fn last_error(&self, name: &str) -> Result<Option<String>> {
        let graph = lock(&self.graph);
        graph
            .get(name)
            .map(|n| n.last_error().map(str::to_string))
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    pub fn dependents(&self, name: &str) -> Result<Vec<String>> {
        lock(&self.graph).dependents(name)
    }

    /// Finalized and staged tasks owned by `module`.
    pub fn tasks_owned_by(&self, module: &str) -> Vec<String> {
        lock(&self.graph).owned_by(module)
    }

    /// Unload `module` from `modules` if no task, finalized or staged,
    /// belongs to it. Registration is locked out until the unload is done.
    pub fn unload_module(&self, module: &str, modules: &ModuleRegistry) -> Result<()> {
        let graph = lock(&self.graph);
        if !graph.owned_by(module).is_empty() {
            return Err(Error::ModuleBusy(module.to_string()));
        }
        modules.unload(module)
    }

    /// Number of cycles started so far.
    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    // ========== Execution ==========

    /// Run one cycle to completion.
    ///
    /// Returns once no participating task is Pending, Ready or Running.
    /// Task failures are reported in the [`CycleReport`], not as errors.
    ///
    /// # Errors
    /// `InvalidArgument` when called from inside a task body, which would
    /// wait on itself.
    pub fn run_cycle(&self, core: &Arc<Core>) -> Result<CycleReport> {
        if IN_TASK_BODY.with(Cell::get) {
            return Err(Error::InvalidArgument(
                "run_cycle cannot be called from a task body".to_string(),
            ));
        }

        let driver = lock(&self.driver);
        while driver.modules.try_recv().is_ok() {}

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let mut run = CycleRun {
            cycle,
            report: CycleReport::new(cycle),
            skipped: HashSet::new(),
            running: 0,
        };

        {
            let mut graph = lock(&self.graph);
            let staged = graph.staged_count();
            if staged > 0 {
                slog_warn!(
                    core.log(),
                    "cycle {}: {} staged tasks are not finalized and will not run",
                    cycle,
                    staged
                );
            }
            for index in graph.indices_in_order() {
                if let Some(node) = graph.node_mut(index) {
                    if node.state == TaskState::Pending {
                        node.stamp = cycle;
                    }
                }
            }
        }

        loop {
            let held = {
                let mut graph = lock(&self.graph);
                self.advance(core, &mut graph, &mut run)
            };
            if run.running == 0 && held == 0 {
                break;
            }

            select! {
                recv(driver.completions) -> msg => {
                    if let Ok(completion) = msg {
                        let mut graph = lock(&self.graph);
                        Self::complete(core, &mut graph, &mut run, completion);
                    }
                }
                recv(driver.modules) -> _event => {}
            }
        }

        {
            let mut graph = lock(&self.graph);
            Self::finish(core, &mut graph, &run);
        }

        slog_verbose!(
            core.log(),
            "cycle {}: {} completed, {} failed, {} skipped",
            cycle,
            run.report.completed.len(),
            run.report.failed.len(),
            run.report.skipped.len()
        );
        Ok(run.report)
    }

    /// Dispatch every participant that can run now. Returns how many are
    /// held back by a reloading module.
    fn advance(&self, core: &Arc<Core>, graph: &mut TaskGraph, run: &mut CycleRun) -> usize {
        let mut held = 0;
        for index in graph.indices_in_order() {
            let Some(node) = graph.node(index) else {
                continue;
            };
            if node.stamp != run.cycle
                || !matches!(node.state, TaskState::Pending | TaskState::Ready)
            {
                continue;
            }

            let dependencies = graph.dependencies_of(index);
            let failed = dependencies.iter().find_map(|&d| {
                graph
                    .node(d)
                    .filter(|n| n.state == TaskState::Failed)
                    .map(|n| n.name().to_string())
            });
            if let Some(dependency) = failed {
                Self::skip(graph, index, &dependency, run);
                continue;
            }

            let ready = dependencies.iter().all(|&d| {
                graph
                    .node(d)
                    .map_or(true, |n| n.state.satisfies_dependents())
            });
            if ready && !self.dispatch(core, graph, index, run) {
                held += 1;
            }
        }
        held
    }

    /// Submit one task to its pool. Returns false if the task is held.
    fn dispatch(
        &self,
        core: &Arc<Core>,
        graph: &mut TaskGraph,
        index: NodeIndex,
        run: &mut CycleRun,
    ) -> bool {
        let Some(node) = graph.node_mut(index) else {
            return true;
        };
        let name = node.spec.name.clone();
        let pool = node.spec.pool.clone();
        let body = Arc::clone(&node.spec.body);
        let module = node.spec.module.clone();

        if let Some(owner) = module.as_deref() {
            match core.modules().module_state(owner) {
                ModuleState::Active => {}
                ModuleState::Reloading => {
                    if node.state != TaskState::Ready {
                        node.state = TaskState::Ready;
                        slog_debug!(core.log(), "task {} held: module {} is reloading", name, owner);
                    }
                    return false;
                }
                ModuleState::Unloaded => {
                    let cause = Error::UnknownModule(owner.to_string()).to_string();
                    Self::fail(core, graph, index, cause, run);
                    return true;
                }
            }
        }

        let job = self.job(core, index, body, module);
        match core.pools().execute(&pool, job) {
            Ok(()) => {
                if let Some(node) = graph.node_mut(index) {
                    node.state = TaskState::Running;
                    node.runs += 1;
                    node.last_error = None;
                }
                run.running += 1;
                slog_debug!(core.log(), "task {} dispatched to pool {}", name, pool);
            }
            Err(e) => Self::fail(core, graph, index, e.to_string(), run),
        }
        true
    }

    fn job(&self, core: &Arc<Core>, node: NodeIndex, body: TaskBody, module: Option<String>) -> Job {
        let owner = Arc::clone(core);
        let completions = self.completions_tx.clone();
        Box::new(move || {
            let outcome = Self::execute(&owner, &body, module.as_deref());
            // The core reference goes before reporting, so the last owner is
            // never a worker.
            drop(owner);
            let _ = completions.send(Completion { node, outcome });
        })
    }

    /// Run a body on the current worker.
    ///
    /// A module-owned body is admitted to its module only here, when it is
    /// about to start, so a job still queued behind a reload never counts
    /// as in flight. The admission is released before this returns.
    fn execute(core: &Core, body: &TaskBody, module: Option<&str>) -> Outcome {
        let guard = match module {
            Some(module) => match core.modules().acquire(module) {
                Ok(Some(guard)) => Some(guard),
                Ok(None) => return Outcome::Held,
                Err(e) => return Outcome::Failed(e.to_string()),
            },
            None => None,
        };
        let _owner = guard.as_ref().map(InFlight::enter);
        let _body = BodyScope::enter();
        match panic::catch_unwind(AssertUnwindSafe(|| body(core))) {
            Ok(Ok(())) => Outcome::Done,
            Ok(Err(e)) => Outcome::Failed(e.to_string()),
            Err(payload) => Outcome::Failed(format!("panicked: {}", panic_message(payload.as_ref()))),
        }
    }

    fn complete(core: &Core, graph: &mut TaskGraph, run: &mut CycleRun, completion: Completion) {
        run.running = run.running.saturating_sub(1);
        match completion.outcome {
            Outcome::Done => {
                let Some(node) = graph.node_mut(completion.node) else {
                    return;
                };
                node.state = if node.retire_requested {
                    node.retire_requested = false;
                    TaskState::Retired
                } else {
                    TaskState::Completed
                };
                run.report.completed.push(node.name().to_string());
                slog_debug!(core.log(), "task {} completed", node.name());
            }
            Outcome::Failed(cause) => Self::fail(core, graph, completion.node, cause, run),
            Outcome::Held => {
                let Some(node) = graph.node_mut(completion.node) else {
                    return;
                };
                node.runs = node.runs.saturating_sub(1);
                if node.retire_requested {
                    node.retire_requested = false;
                    node.state = TaskState::Retired;
                } else {
                    node.state = TaskState::Ready;
                }
                slog_debug!(
                    core.log(),
                    "task {} held on its worker: module is reloading",
                    node.name()
                );
            }
        }
    }

    /// Record an original failure and fail its dependents.
    fn fail(core: &Core, graph: &mut TaskGraph, index: NodeIndex, cause: String, run: &mut CycleRun) {
        let name = match graph.node_mut(index) {
            Some(node) => {
                node.state = TaskState::Failed;
                node.last_error = Some(cause.clone());
                node.name().to_string()
            }
            None => return,
        };
        let skipped = Self::propagate(graph, index, run);
        slog_error!(
            core.log(),
            "task {} failed: {} ({} dependents skipped)",
            name,
            cause,
            skipped
        );
        run.report.failed.push(TaskFailure { task: name, cause });
    }

    /// Fail a task that cannot run because `dependency` failed earlier.
    fn skip(graph: &mut TaskGraph, index: NodeIndex, dependency: &str, run: &mut CycleRun) {
        if let Some(node) = graph.node_mut(index) {
            node.state = TaskState::Failed;
            node.last_error = Some(format!("dependency {} failed", dependency));
            run.report.skipped.push(node.name().to_string());
            run.skipped.insert(index);
        }
        Self::propagate(graph, index, run);
    }

    /// Mark every Pending participant downstream of `origin` as Failed.
    /// Returns how many were marked.
    fn propagate(graph: &mut TaskGraph, origin: NodeIndex, run: &mut CycleRun) -> usize {
        let mut marked = 0;
        let mut queue = VecDeque::from([origin]);
        while let Some(current) = queue.pop_front() {
            let parent = match graph.node(current) {
                Some(node) => node.name().to_string(),
                None => continue,
            };
            for dependent in graph.dependents_of(current) {
                let Some(node) = graph.node_mut(dependent) else {
                    continue;
                };
                if node.stamp != run.cycle || node.state != TaskState::Pending {
                    continue;
                }
                node.state = TaskState::Failed;
                node.last_error = Some(format!("dependency {} failed", parent));
                run.report.skipped.push(node.name().to_string());
                run.skipped.insert(dependent);
                queue.push_back(dependent);
                marked += 1;
            }
        }
        marked
    }

    /// Settle states for the next cycle.
    fn finish(core: &Core, graph: &mut TaskGraph, run: &CycleRun) {
        let mut waiting = Vec::new();
        for index in graph.indices_in_order() {
            let Some(node) = graph.node_mut(index) else {
                continue;
            };
            if node.retire_requested {
                node.retire_requested = false;
                node.state = TaskState::Retired;
                continue;
            }
            match (node.state, node.spec.kind) {
                (TaskState::Completed, TaskKind::Once) => node.state = TaskState::Retired,
                (TaskState::Completed, TaskKind::Repeated) => node.state = TaskState::Pending,
                (TaskState::Failed, TaskKind::Repeated) => node.state = TaskState::Pending,
                // Skipped Once tasks never ran; they get another chance.
                (TaskState::Failed, TaskKind::Once) if run.skipped.contains(&index) => {
                    node.state = TaskState::Pending
                }
                (TaskState::Ready, _) => node.state = TaskState::Pending,
                (TaskState::Pending, _) if node.stamp == run.cycle => {
                    waiting.push(node.name().to_string())
                }
                _ => {}
            }
        }
        if !waiting.is_empty() {
            slog_warn!(
                core.log(),
                "cycle {}: {} never became ready",
                run.cycle,
                waiting.join(", ")
            );
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("graph", &*lock(&self.graph))
            .field("cycles", &self.cycle_count())
            .finish()
    }
}
