//! Loading of the task configuration.
//!
//! A configuration file is TOML and holds the pool size and a list of tasks.
//! Tasks are kept as plain tables, turning them into validated tasks is the
//! job of the [task](crate::task) module.
//!
//! ```toml
//! workers = 2
//!
//! [[task]]
//! name = "site1"
//! type = "dir"
//! sources = ["/var/www/site1"]
//! retention_period = 7
//!
//! [task.dst_backend.local]
//! path = "/srv/backup"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};
use toml::Table;

use crate::backends::SecurityError;

#[derive(Debug, Display, Error, From)]
/// Errors in the configuration of tasks and backends.
pub enum ConfigError {
    /// The configuration file doesn't exist.
    #[display("Can't find a config file \"{}\"", _0.display())]
    NotFound(#[error(ignore)] PathBuf),
    /// The configuration path isn't a regular file.
    #[display("The config: {} does not appear to be a file", _0.display())]
    NotAFile(#[error(ignore)] PathBuf),
    /// Reading the configuration file failed.
    #[display("Can't read the config {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    /// The configuration file isn't valid TOML.
    #[display("The config: {} is not a valid TOML file: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// The inline task isn't a valid TOML table.
    #[display("Can't parse the inline task: {_0}")]
    Inline(toml::de::Error),
    /// The configuration doesn't declare any task.
    #[display("No tasks found in {_0}")]
    NoTasks(#[error(ignore)] String),
    /// No task matches the requested name.
    #[display("Can't find a task named {_0}")]
    UnknownTask(#[error(ignore)] String),
    /// An operation needs exactly one task.
    #[display("Expected exactly one task, got {_0}; select one with --task-name")]
    AmbiguousTask(#[error(ignore)] usize),
    /// No backend type of that name is registered.
    #[display("Unknown backend type: {_0}")]
    UnknownBackend(#[error(ignore)] String),
    /// The configuration of a backend is malformed.
    #[display("Incorrect configuration of the {kind} backend: {reason}")]
    InvalidBackend { kind: String, reason: String },
    /// A task doesn't declare any destination backend.
    #[display("Incorrect config, can't find a dst_backend")]
    NoBackend,
    /// A configured location escapes its root.
    #[from]
    Security(SecurityError),
}

/// Content of a configuration file.
#[derive(Debug, Default, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of tasks processed concurrently.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Task entries, validated individually later on.
    #[serde(default, rename = "task")]
    pub tasks: Vec<Table>,
}

impl Config {
    /// Reads the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        if !path.is_file() {
            return Err(ConfigError::NotAFile(path.to_path_buf()));
        }

        log::debug!(target: "config", "Reading config {}", path.display());
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if config.tasks.is_empty() {
            return Err(ConfigError::NoTasks(path.display().to_string()));
        }
        log::debug!(target: "config", "Loaded {} task(s)", config.tasks.len());

        Ok(config)
    }

    /// Configuration of a single task given as TOML inline table.
    ///
    /// ```
    /// # use sbackup_lib::config::Config;
    /// let config = Config::from_inline(
    ///     r#"{ name = "site1", type = "dir", sources = ["/tmp"], dst_backend = { local = { path = "/srv" } } }"#,
    /// ).unwrap();
    /// assert_eq!(config.tasks.len(), 1);
    /// ```
    pub fn from_inline(task: &str) -> Result<Self, ConfigError> {
        let mut document: Table =
            toml::from_str(&format!("task = {task}")).map_err(ConfigError::Inline)?;

        match document.remove("task") {
            Some(toml::Value::Table(task)) => Ok(Self {
                workers: None,
                tasks: vec![task],
            }),
            _ => Err(ConfigError::NoTasks("the inline task".to_string())),
        }
    }

    /// Tasks called `name`, or every task if `name` is [None].
    pub fn select(&self, name: Option<&str>) -> Result<Vec<Table>, ConfigError> {
        let Some(name) = name else {
            return Ok(self.tasks.clone());
        };

        let selected: Vec<_> = self
            .tasks
            .iter()
            .filter(|task| task.get("name").and_then(toml::Value::as_str) == Some(name))
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(ConfigError::UnknownTask(name.to_string()));
        }
        Ok(selected)
    }

    /// The only task, or the task called `name`.
    pub fn select_one(&self, name: Option<&str>) -> Result<Table, ConfigError> {
        let mut selected = self.select(name)?;
        match selected.len() {
            1 => Ok(selected.remove(0)),
            n => Err(ConfigError::AmbiguousTask(n)),
        }
    }
}
