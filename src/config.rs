//! Config collaborator and host settings.
//!
//! [`ConfigStore`] is the typed key/value surface handed to task bodies.
//! [`Settings`] is the host bootstrap file (`~/.slate/slate.toml`) that names
//! pools, the log destination and the initial config values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::log::LogCategory;
use crate::util::{read, write};
use crate::{Error, Result};

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Integer(_) => "integer",
            ConfigValue::Real(_) => "real",
            ConfigValue::Text(_) => "text",
            ConfigValue::Boolean(_) => "boolean",
        }
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Integer(v)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Real(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Text(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Text(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Boolean(v)
    }
}

/// Typed configuration storage.
///
/// The typed getters return `default` when the key is absent or holds a
/// value of another type; nothing is coerced.
pub trait ConfigStore: Send + Sync {
    fn set(&self, key: &str, value: ConfigValue);

    fn get(&self, key: &str) -> Option<ConfigValue>;

    fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(ConfigValue::Integer(v)) => v,
            _ => default,
        }
    }

    fn get_float(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(ConfigValue::Real(v)) => v,
            _ => default,
        }
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(ConfigValue::Text(v)) => v,
            _ => default.to_string(),
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(ConfigValue::Boolean(v)) => v,
            _ => default,
        }
    }
}

/// In-memory [`ConfigStore`].
#[derive(Debug, Default)]
pub struct MemoryConfig {
    values: RwLock<HashMap<String, ConfigValue>>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from TOML text. Nested tables become dotted keys.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = text.parse()?;
        let store = Self::new();
        store.merge_table(&table);
        Ok(store)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Insert every scalar in `table`, overwriting existing keys.
    pub fn merge_table(&self, table: &toml::Table) {
        let mut values = write(&self.values);
        flatten_into(&mut values, "", table);
    }

    pub fn len(&self) -> usize {
        read(&self.values).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.values).is_empty()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = read(&self.values).keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ConfigStore for MemoryConfig {
    fn set(&self, key: &str, value: ConfigValue) {
        write(&self.values).insert(key.to_string(), value);
    }

    fn get(&self, key: &str) -> Option<ConfigValue> {
        read(&self.values).get(key).cloned()
    }
}

fn flatten_into(out: &mut HashMap<String, ConfigValue>, prefix: &str, table: &toml::Table) {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        let converted = match value {
            toml::Value::Integer(v) => ConfigValue::Integer(*v),
            toml::Value::Float(v) => ConfigValue::Real(*v),
            toml::Value::String(v) => ConfigValue::Text(v.clone()),
            toml::Value::Boolean(v) => ConfigValue::Boolean(*v),
            toml::Value::Table(inner) => {
                flatten_into(out, &full, inner);
                continue;
            }
            // Arrays and datetimes have no ConfigValue counterpart.
            toml::Value::Array(_) | toml::Value::Datetime(_) => continue,
        };
        out.insert(full, converted);
    }
}

/// A pool declared in the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub name: String,
    pub threads: u32,
}

/// Host bootstrap settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: LogCategory,
    pub log_path: Option<String>,
    #[serde(default)]
    pub pools: Vec<PoolSettings>,
    #[serde(default)]
    pub config: toml::Table,
}

fn default_log_level() -> LogCategory {
    LogCategory::Info
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_path: None,
            pools: Vec::new(),
            config: toml::Table::new(),
        }
    }
}

impl Settings {
    pub fn slate_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".slate"))
    }

    pub fn settings_path() -> Result<PathBuf> {
        Ok(Self::slate_dir()?.join("slate.toml"))
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = Self::settings_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let settings: Self = toml::from_str(&fs::read_to_string(path)?)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Pool names must be unique and every pool needs at least one thread.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            if pool.threads == 0 {
                return Err(Error::InvalidArgument(format!(
                    "pool {} needs at least one thread",
                    pool.name
                )));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(Error::DuplicateName(pool.name.clone()));
            }
        }
        Ok(())
    }

    /// Resolved log file location, `~/.slate/slate.log` unless overridden.
    pub fn effective_log_path(&self) -> Result<PathBuf> {
        match &self.log_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::slate_dir()?.join("slate.log")),
        }
    }

    /// Copy the `[config]` table into a store.
    pub fn seed(&self, store: &MemoryConfig) {
        store.merge_table(&self.config);
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
