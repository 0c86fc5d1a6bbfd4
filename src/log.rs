//! Log collaborator.
//!
//! Categories, most severe first:
//! - CRITICAL: the host cannot keep running as configured
//! - ERROR: a task or reload failed
//! - WARNING: unexpected but recoverable conditions
//! - INFO: lifecycle notifications (pools, modules, finalize)
//! - VERBOSE: per-cycle summaries
//! - DEBUG: per-task dispatch traces
//!
//! The engine formats its own messages and forwards them to a [`LogSink`];
//! filtering is the sink's business. Debug output for [`FileLog`] can be
//! enabled with `SLATE_DEBUG=1`.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::util::lock;
use crate::{Error, Result};

/// Log categories for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LogCategory {
    Critical = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Verbose = 4,
    Debug = 5,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Critical => "CRITICAL",
            LogCategory::Error => "ERROR",
            LogCategory::Warning => "WARNING",
            LogCategory::Info => "INFO",
            LogCategory::Verbose => "VERBOSE",
            LogCategory::Debug => "DEBUG",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogCategory::Critical,
            1 => LogCategory::Error,
            2 => LogCategory::Warning,
            3 => LogCategory::Info,
            4 => LogCategory::Verbose,
            _ => LogCategory::Debug,
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(LogCategory::Critical),
            "error" => Ok(LogCategory::Error),
            "warning" | "warn" => Ok(LogCategory::Warning),
            "info" => Ok(LogCategory::Info),
            "verbose" => Ok(LogCategory::Verbose),
            "debug" => Ok(LogCategory::Debug),
            other => Err(Error::InvalidArgument(format!(
                "unknown log category: {}",
                other
            ))),
        }
    }
}

/// Destination for everything the engine has to say.
pub trait LogSink: Send + Sync {
    fn log(&self, category: LogCategory, message: &str);
}

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn log(&self, category: LogCategory, message: &str) {
        (**self).log(category, message)
    }
}

/// Forward a message to a sink. Used by the `slog!` macros.
pub fn emit<S: LogSink + ?Sized>(sink: &S, category: LogCategory, message: &str) {
    sink.log(category, message);
}

/// Appends timestamped lines to a file.
///
/// The file is truncated when the sink is created, so each host run starts
/// with a fresh log.
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    max: AtomicU8,
}

impl FileLog {
    pub fn new(path: impl Into<PathBuf>, max: LogCategory) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&path, "")?;
        Ok(Self {
            path,
            max: AtomicU8::new(max as u8),
        })
    }

    /// `~/.slate/slate.log`
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".slate")
            .join("slate.log"))
    }

    /// True when `SLATE_DEBUG` asks for debug output.
    pub fn debug_from_env() -> bool {
        std::env::var("SLATE_DEBUG")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_max(&self, max: LogCategory) {
        self.max.store(max as u8, Ordering::SeqCst);
    }

    pub fn max(&self) -> LogCategory {
        LogCategory::from_u8(self.max.load(Ordering::Relaxed))
    }
}

impl LogSink for FileLog {
    fn log(&self, category: LogCategory, message: &str) {
        if category > self.max() {
            return;
        }

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, category.as_str(), message);
        }
    }
}

/// A captured log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub category: LogCategory,
    pub message: String,
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        lock(&self.records).clone()
    }

    /// Messages logged under exactly `category`.
    pub fn messages(&self, category: LogCategory) -> Vec<String> {
        lock(&self.records)
            .iter()
            .filter(|r| r.category == category)
            .map(|r| r.message.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        lock(&self.records).iter().any(|r| r.message.contains(needle))
    }

    pub fn clear(&self) {
        lock(&self.records).clear();
    }
}

impl LogSink for MemoryLog {
    fn log(&self, category: LogCategory, message: &str) {
        lock(&self.records).push(LogRecord {
            category,
            message: message.to_string(),
        });
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl LogSink for NullLog {
    fn log(&self, _category: LogCategory, _message: &str) {}
}

/// Format and forward a message at an explicit category.
#[macro_export]
macro_rules! slog {
    ($sink:expr, $category:expr, $($arg:tt)*) => {
        $crate::log::emit($sink, $category, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! slog_error {
    ($sink:expr, $($arg:tt)*) => {
        $crate::slog!($sink, $crate::log::LogCategory::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! slog_warn {
    ($sink:expr, $($arg:tt)*) => {
        $crate::slog!($sink, $crate::log::LogCategory::Warning, $($arg)*)
    };
}

#[macro_export]
macro_rules! slog_info {
    ($sink:expr, $($arg:tt)*) => {
        $crate::slog!($sink, $crate::log::LogCategory::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! slog_verbose {
    ($sink:expr, $($arg:tt)*) => {
        $crate::slog!($sink, $crate::log::LogCategory::Verbose, $($arg)*)
    };
}

#[macro_export]
macro_rules! slog_debug {
    ($sink:expr, $($arg:tt)*) => {
        $crate::slog!($sink, $crate::log::LogCategory::Debug, $($arg)*)
    };
}
