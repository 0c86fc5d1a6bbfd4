use thiserror::Error;

use crate::module::Version;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Name already registered: {0}")]
    DuplicateName(String),

    #[error("Pool not found: {0}")]
    UnknownPool(String),

    #[error("Task not found: {0}")]
    UnknownTask(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Module not found: {0}")]
    UnknownModule(String),

    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Module {module} cannot go from version {current} back to {requested}")]
    VersionRegression {
        module: String,
        current: Version,
        requested: Version,
    },

    #[error("Module is busy: {0}")]
    ModuleBusy(String),

    #[error("Task {task} failed: {cause}")]
    TaskFailure { task: String, cause: String },

    #[error("Task {task} still has dependents: {}", .dependents.join(", "))]
    HasDependents {
        task: String,
        dependents: Vec<String>,
    },

    #[error("Task is running: {0}")]
    TaskRunning(String),

    #[error("Module {module} does not expose a {expected} interface")]
    InterfaceMismatch {
        module: String,
        expected: &'static str,
    },

    #[error("Module {module} failed to load: {reason}")]
    LoadFailed { module: String, reason: String },

    #[error(
        "Module {module} failed to load ({cause}) and stays registered for: {}",
        .remaining.join(", ")
    )]
    RollbackIncomplete {
        module: String,
        cause: Box<Error>,
        remaining: Vec<String>,
    },

    #[error("Worker in pool {pool} panicked: {message}")]
    WorkerPanicked { pool: String, message: String },

    #[error("No home directory")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, Error>;
