//! Backup tasks built from configuration tables.
//!
//! A task type describes its configuration with a static
//! [Schema](schema::Schema) and is registered in the [TaskRegistry] under
//! its `type` tag. Currently the following task types are implemented:
//!
//! - [DirTask] (`dir`): Archives files and directories and ships the
//!   archive to one or more backends.

pub mod archive;
pub mod dir;
pub mod schema;

pub use archive::PackagingError;
pub use dir::{DirTask, TaskState};
pub use schema::{FieldError, FieldErrorKind, FieldErrors};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;

use derive_more::{Display, Error, From};
use toml::{Table, Value};

use crate::backends::{BackendError, BackendRegistry, DeleteReport, BACKEND_KEYS};
use crate::config::ConfigError;

#[derive(Debug, Display, Error, From)]
/// Errors of a task operation.
pub enum TaskError {
    /// Fields of the task are missing or invalid.
    #[from]
    Fields(FieldErrors),
    /// The configuration is malformed.
    #[from]
    Config(ConfigError),
    /// Building the archive failed.
    #[from]
    Packaging(PackagingError),
    /// A backend operation failed.
    #[from]
    Backend(BackendError),
    /// No task type of that name is registered.
    #[display("Can't work with backup's type {_0}")]
    UnknownType(#[error(ignore)] String),
    /// No backup is stored to restore from.
    #[display("Can't find a backup starting with {_0}")]
    NoBackup(#[error(ignore)] String),
    /// No backend accepted the archive.
    #[display("Upload of {archive} failed on every backend")]
    UploadFailed {
        archive: String,
        failures: Vec<(String, BackendError)>,
    },
    /// Creating the scoped temporary directory failed.
    #[display("Can't create a temporary directory: {_0}")]
    TempDir(io::Error),
    /// Extracting or moving restored files failed.
    #[display("Can't restore {}: {source}", path.display())]
    Restore { path: PathBuf, source: io::Error },
}

/// Result of [Task::create].
#[derive(Debug)]
pub struct CreateReport {
    /// Name of the uploaded archive.
    pub archive: String,
    /// Backends that stored the archive.
    pub uploaded: Vec<String>,
    /// Backends that failed.
    pub failed: Vec<(String, BackendError)>,
}

impl fmt::Display for CreateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.uploaded.len() + self.failed.len();
        write!(
            f,
            "uploaded {} to {}/{total} backend(s)",
            self.archive,
            self.uploaded.len()
        )?;
        for (backend, error) in &self.failed {
            write!(f, "; {backend} failed: {error}")?;
        }
        Ok(())
    }
}

/// Result of [Task::restore].
#[derive(Debug)]
pub struct RestoreReport {
    /// Name of the restored archive.
    pub archive: String,
    /// Backend the archive was downloaded from.
    pub backend: String,
    /// Replaced source paths.
    pub restored: Vec<PathBuf>,
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "restored {} path(s) from {} on {}",
            self.restored.len(),
            self.archive,
            self.backend
        )
    }
}

/// A configured backup job.
pub trait Task: Send + fmt::Debug {
    /// Name of the task.
    fn name(&self) -> &str;

    /// Validates all fields and backends, reporting every failure at once.
    ///
    /// Validation is idempotent.
    fn validate(&mut self) -> Result<(), TaskError>;

    /// Creates a backup and uploads it to every backend.
    fn create(&mut self) -> Result<CreateReport, TaskError>;

    /// Restores the backup `backup`, or the latest one if [None].
    fn restore(&mut self, backup: Option<&str>) -> Result<RestoreReport, TaskError>;

    /// Deletes backups older than the retention period of the task.
    ///
    /// Returns [None] if the task has no retention period.
    fn remove_old_files(&mut self) -> Result<Option<DeleteReport>, TaskError>;
}

/// What a task is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Purpose {
    /// Backing up and pruning. The sources have to exist.
    #[display("backup")]
    Backup,
    /// Restoring over the sources, which may be missing.
    #[display("restore")]
    Restore,
}

/// Builds a task from its configuration table.
pub type TaskConstructor =
    fn(&Table, &BackendRegistry, Purpose) -> Result<Box<dyn Task>, TaskError>;

/// Constructors of the known task types and the backends they may use.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    constructors: HashMap<String, TaskConstructor>,
    backends: BackendRegistry,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::with_backends(BackendRegistry::default())
    }
}

impl TaskRegistry {
    /// Registry of the built-in task types using `backends`.
    pub fn with_backends(backends: BackendRegistry) -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
            backends,
        };
        registry.register(dir::TYPE, DirTask::boxed);
        registry
    }

    /// Registers `constructor` for `kind`, replacing a previous one.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        constructor: TaskConstructor,
    ) -> Option<TaskConstructor> {
        self.constructors.insert(kind.into(), constructor)
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Builds the task described by `config`, dispatching on its `type`.
    pub fn create_task(&self, config: &Table) -> Result<Box<dyn Task>, TaskError> {
        self.create_task_for(config, Purpose::Backup)
    }

    /// Like [create_task](Self::create_task) for a task that will restore.
    pub fn create_restore_task(&self, config: &Table) -> Result<Box<dyn Task>, TaskError> {
        self.create_task_for(config, Purpose::Restore)
    }

    fn create_task_for(&self, config: &Table, purpose: Purpose) -> Result<Box<dyn Task>, TaskError> {
        let kind = match config.get("type") {
            Some(Value::String(kind)) => kind,
            other => {
                let mut errors = FieldErrors::default();
                match other {
                    Some(other) => errors.invalid(
                        "type",
                        format!("The type has to be a string, got {}", other.type_str()),
                    ),
                    None => errors.missing("type"),
                }
                errors.extend(missing_common_fields(config));
                log::error!(target: "task", "Invalid task {}: {errors}", task_label(config));
                return Err(errors.into());
            }
        };

        let constructor = self.constructors.get(kind).ok_or_else(|| {
            log::error!(target: "task", "Can't work with backup's type {kind}");
            TaskError::UnknownType(kind.clone())
        })?;
        constructor(config, &self.backends, purpose)
    }
}

/// Keys every task type requires, checked when the type is unknown.
fn missing_common_fields(config: &Table) -> FieldErrors {
    let mut errors = FieldErrors::default();
    let name = config.get("name").and_then(Value::as_str);
    if name.is_none_or(|name| name.trim().is_empty()) {
        errors.missing("name");
    }
    if !BACKEND_KEYS.iter().any(|key| config.contains_key(*key)) {
        errors.missing(BACKEND_KEYS[0]);
    }
    errors
}

/// Name used to report on a task configuration, valid or not.
pub fn task_label(config: &Table) -> String {
    config
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_task_dispatches_on_type() {
        let registry = TaskRegistry::default();

        let err = registry.create_task(&Table::new()).unwrap_err();
        assert!(matches!(&err, TaskError::Fields(e) if e.missing_fields()[0] == "type"));

        let config: Table = toml::from_str("type = 'mysql'\nname = 'db'").unwrap();
        let err = registry.create_task(&config).unwrap_err();
        assert!(matches!(err, TaskError::UnknownType(kind) if kind == "mysql"));

        let config: Table = toml::from_str("type = 3").unwrap();
        assert!(matches!(
            registry.create_task(&config),
            Err(TaskError::Fields(_))
        ));
    }

    #[test]
    fn missing_type_reports_other_missing_fields() {
        let registry = TaskRegistry::default();

        let config: Table = toml::from_str("name = ''").unwrap();
        let err = registry.create_task(&config).unwrap_err();
        let TaskError::Fields(errors) = err else {
            panic!("expected field errors, got {err}");
        };
        assert_eq!(errors.missing_fields(), ["type", "name", "dst_backend"]);

        let config: Table =
            toml::from_str("type = 3\nname = 'site1'\ndst_backends = { local = {} }").unwrap();
        let err = registry.create_restore_task(&config).unwrap_err();
        let TaskError::Fields(errors) = err else {
            panic!("expected field errors, got {err}");
        };
        assert_eq!(errors.len(), 1);
        assert!(errors.get("type").unwrap().contains("integer"));
    }

    #[test]
    fn labels_fall_back_for_unnamed_tasks() {
        let config: Table = toml::from_str("name = 'site1'").unwrap();
        assert_eq!(task_label(&config), "site1");
        assert_eq!(task_label(&Table::new()), "<unnamed>");
    }
}
