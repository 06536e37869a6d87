//! Storage backends receiving backup archives.
//!
//! Every destination implements the [Backend] trait. Implementations only
//! provide connectivity validation, a lazy enumeration of stored objects and
//! three primitives (put, get, remove). Everything else, e.g. retention based
//! deletion or finding the latest backup, is derived from these primitives by
//! the provided methods of the trait.
//!
//! Currently the following backends are implemented:
//!
//! - [Local]: Archives stored in a directory of the local filesystem.
//!
//! Backends are constructed from task configuration through a
//! [BackendRegistry] keyed by the backend type (`local`, ...).

pub mod local;

pub use local::Local;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local as LocalTz, NaiveDate, Utc};
use derive_more::{Display, Error, From};
use toml::{Table, Value};

use crate::config::ConfigError;
use crate::util;

/// Result of a backend operation.
pub type BackendResult<T> = Result<T, BackendError>;

/// Lazy sequence of the objects stored by a backend.
///
/// Every call of [Backend::enumerate] starts a fresh sequence.
pub type Objects<'a> = Box<dyn Iterator<Item = BackendResult<RemoteObject>> + 'a>;

/// Keys of a task configuration holding the destination backends.
pub const BACKEND_KEYS: [&str; 2] = ["dst_backend", "dst_backends"];

/// An object stored by a [Backend].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RemoteObject {
    /// Name of the object relative to the namespace of the backend.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification of the object.
    pub modified: DateTime<Utc>,
}

impl RemoteObject {
    /// Local calendar day the object was last modified.
    pub fn modified_day(&self) -> NaiveDate {
        self.modified.with_timezone(&LocalTz).date_naive()
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors of [Backend] operations.
pub enum BackendError {
    /// Connectivity or precondition check failed.
    #[display("{_0}")]
    Validation(#[error(ignore)] String),
    /// The remote object doesn't exist.
    #[display("The object {_0} does not exist")]
    NotFound(#[error(ignore)] String),
    /// The local file to upload doesn't exist.
    #[display("Can't find a path {}", _0.display())]
    MissingSource(#[error(ignore)] PathBuf),
    /// The local download destination is unusable.
    #[display("Can't write to {}: {reason}", path.display())]
    Destination { path: PathBuf, reason: String },
    /// A name would leave the namespace of the backend.
    #[from]
    Security(SecurityError),
    /// Transfer failed, possibly transient.
    #[from]
    #[display("I/O error: {_0}")]
    Io(io::Error),
}

impl BackendError {
    /// Returns if a retry of the operation may succeed.
    ///
    /// Nothing in this crate retries automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// A name resolved outside of the namespace root it was meant for.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("The name {name:?} escapes the namespace {}", root.display())]
pub struct SecurityError {
    /// Offending name.
    pub name: String,
    /// Root the name has to stay in.
    pub root: PathBuf,
}

/// Resolves `name` below `root` rejecting anything that escapes it.
///
/// The resolution is purely lexical: `a/../b` is fine, `../b`, `/b` and the
/// empty name are not.
pub fn scoped_path(root: &Path, name: &str) -> Result<PathBuf, SecurityError> {
    let escape = || SecurityError {
        name: name.to_string(),
        root: root.to_path_buf(),
    };

    let mut parts: Vec<&OsStr> = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(escape());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    if parts.is_empty() {
        return Err(escape());
    }

    Ok(parts
        .into_iter()
        .fold(root.to_path_buf(), |path, part| path.join(part)))
}

/// Outcome of a bulk deletion.
///
/// Failing deletions don't stop the remaining ones, they are collected in
/// [`failed`](Self::failed).
#[derive(Debug, Default)]
pub struct DeleteReport {
    /// Names of the deleted objects.
    pub deleted: Vec<String>,
    /// Objects that couldn't be deleted.
    pub failed: Vec<(String, BackendError)>,
}

impl DeleteReport {
    /// No deletion failed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Appends the results of `other`.
    pub fn merge(&mut self, other: DeleteReport) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }
}

impl fmt::Display for DeleteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deleted {} object(s)", self.deleted.len())?;
        for (name, error) in &self.failed {
            write!(f, "; failed to delete {name}: {error}")?;
        }
        Ok(())
    }
}

/// Generic storage destination.
///
/// Data operations refuse to run until [`validate`](Self::validate)
/// succeeded once.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Type tag the backend is registered under.
    fn kind(&self) -> &'static str;

    /// Human readable location, used in logs and reports.
    fn location(&self) -> String;

    /// Checks that the destination is reachable and usable.
    fn validate(&mut self) -> BackendResult<()>;

    /// Returns if [`validate`](Self::validate) succeeded.
    fn is_validated(&self) -> bool;

    /// Lists the stored objects without checking the validation state.
    fn list_objects(&self) -> BackendResult<Objects<'_>>;

    /// Stores the local file `src` as `name`.
    ///
    /// An object must only become visible once it is complete.
    fn put_object(&self, src: &Path, name: &str) -> BackendResult<()>;

    /// Writes the object `name` to the local file `dst`.
    fn get_object(&self, name: &str, dst: &Path) -> BackendResult<()>;

    /// Removes the object `name`, failing with [BackendError::NotFound] if absent.
    fn remove_object(&self, name: &str) -> BackendResult<()>;

    /// Fails unless the backend was validated.
    fn ensure_validated(&self, operation: &str) -> BackendResult<()> {
        if self.is_validated() {
            Ok(())
        } else {
            Err(BackendError::Validation(format!(
                "Run validate() on {} before {operation}",
                self.location()
            )))
        }
    }

    /// Lazily enumerates the stored objects.
    fn enumerate(&self) -> BackendResult<Objects<'_>> {
        self.ensure_validated("enumerate")?;
        self.list_objects()
    }

    /// Looks up the stored object called `name`.
    fn find(&self, name: &str) -> BackendResult<Option<RemoteObject>> {
        for object in self.enumerate()? {
            let object = object?;
            if object.name == name {
                return Ok(Some(object));
            }
        }
        Ok(None)
    }

    /// Returns if an object called `name` is stored.
    fn contains(&self, name: &str) -> BackendResult<bool> {
        Ok(self.find(name)?.is_some())
    }

    /// Uploads the local file `src` under its file name, which is returned.
    fn upload(&self, src: &Path) -> BackendResult<String> {
        self.ensure_validated("upload")?;
        if !src.is_file() {
            log::error!(target: "backend", "Can't find a path {}", src.display());
            return Err(BackendError::MissingSource(src.to_path_buf()));
        }
        let name = src
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| BackendError::MissingSource(src.to_path_buf()))?
            .to_string();

        log::debug!(target: "backend", "Start uploading {name} to {}", self.location());
        self.put_object(src, &name)?;
        log::info!(target: "backend", "Uploaded {name} to {}", self.location());

        Ok(name)
    }

    /// Downloads `name` into the existing directory `dst_dir`.
    ///
    /// The local file is called `dst_filename` or after the last component of
    /// `name`. Returns the path written.
    fn download(
        &self,
        name: &str,
        dst_dir: &Path,
        dst_filename: Option<&str>,
    ) -> BackendResult<PathBuf> {
        self.ensure_validated("download")?;
        if !dst_dir.is_dir() {
            return Err(BackendError::Destination {
                path: dst_dir.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }
        util::ensure_writable(dst_dir).map_err(|e| BackendError::Destination {
            path: dst_dir.to_path_buf(),
            reason: format!("not writable: {e}"),
        })?;

        let filename = match dst_filename {
            Some(filename) => filename,
            None => Path::new(name)
                .file_name()
                .and_then(OsStr::to_str)
                .ok_or_else(|| SecurityError {
                    name: name.to_string(),
                    root: dst_dir.to_path_buf(),
                })?,
        };
        let dst = scoped_path(dst_dir, filename)?;

        log::debug!(target: "backend", "Start download of {name} from {}", self.location());
        self.get_object(name, &dst)?;

        Ok(dst)
    }

    /// Deletes exactly the object `name`.
    fn delete(&self, name: &str) -> BackendResult<()> {
        self.ensure_validated("delete")?;
        self.remove_object(name)?;
        log::info!(target: "backend", "Deleted {name} from {}", self.location());
        Ok(())
    }

    /// Deletes every object last modified strictly before `cutoff`.
    fn delete_older(&self, cutoff: NaiveDate) -> BackendResult<DeleteReport> {
        self.delete_older_matching(cutoff, &|_| true)
    }

    /// Like [`delete_older`](Self::delete_older) restricted to names
    /// accepted by `matches`.
    fn delete_older_matching(
        &self,
        cutoff: NaiveDate,
        matches: &dyn Fn(&str) -> bool,
    ) -> BackendResult<DeleteReport> {
        self.ensure_validated("delete_older")?;

        let mut expired = Vec::new();
        for object in self.enumerate()? {
            let object = object?;
            if matches(&object.name) && object.modified_day() < cutoff {
                expired.push(object.name);
            }
        }

        let mut report = DeleteReport::default();
        for name in expired {
            match self.remove_object(&name) {
                Ok(()) => {
                    log::info!(target: "backend", "Deleted expired {name} from {}", self.location());
                    report.deleted.push(name);
                }
                Err(e) => {
                    log::error!(target: "backend", "Can't delete {name} from {}: {e}", self.location());
                    report.failed.push((name, e));
                }
            }
        }

        Ok(report)
    }

    /// Most recently modified object whose name starts with `prefix`.
    fn last_backup(&self, prefix: &str) -> BackendResult<Option<RemoteObject>> {
        self.last_backup_matching(&|name| name.starts_with(prefix))
    }

    /// Most recently modified object whose name is accepted by `matches`.
    fn last_backup_matching(
        &self,
        matches: &dyn Fn(&str) -> bool,
    ) -> BackendResult<Option<RemoteObject>> {
        let mut last: Option<RemoteObject> = None;
        for object in self.enumerate()? {
            let object = object?;
            if !matches(&object.name) {
                continue;
            }
            if last.as_ref().is_none_or(|l| object.modified > l.modified) {
                last = Some(object);
            }
        }
        Ok(last)
    }
}

/// Configuration of a single destination: the backend type and its table.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSpec {
    /// Registered backend type, e.g. `local`.
    pub kind: String,
    /// Backend specific settings.
    pub config: Table,
}

impl BackendSpec {
    /// Reads the `{ <type> = { ... } }` mapping of destination backends.
    pub fn from_mapping(value: &Value) -> Result<Vec<BackendSpec>, ConfigError> {
        let mapping = value.as_table().ok_or_else(|| ConfigError::InvalidBackend {
            kind: "dst_backend".to_string(),
            reason: format!("has to be a table, got {}", value.type_str()),
        })?;
        if mapping.is_empty() {
            return Err(ConfigError::NoBackend);
        }

        mapping
            .iter()
            .map(|(kind, config)| {
                let config = config
                    .as_table()
                    .ok_or_else(|| ConfigError::InvalidBackend {
                        kind: kind.clone(),
                        reason: format!("has to be a table, got {}", config.type_str()),
                    })?
                    .clone();
                Ok(BackendSpec {
                    kind: kind.clone(),
                    config,
                })
            })
            .collect()
    }

    /// Destination backends declared by a task configuration.
    pub fn from_task(task: &Table) -> Result<Vec<BackendSpec>, ConfigError> {
        let value = BACKEND_KEYS
            .iter()
            .find_map(|key| task.get(*key))
            .ok_or(ConfigError::NoBackend)?;
        Self::from_mapping(value)
    }
}

/// Builds a backend from its configuration table.
pub type BackendConstructor = fn(&Table) -> Result<Box<dyn Backend>, ConfigError>;

/// Constructors of the known backend types.
#[derive(Clone)]
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(local::KIND, Local::from_config);
        registry
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

impl BackendRegistry {
    /// Registry without any backend type.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registers `constructor` for `kind`, replacing a previous one.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        constructor: BackendConstructor,
    ) -> Option<BackendConstructor> {
        self.constructors.insert(kind.into(), constructor)
    }

    /// Registered backend types.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Constructs the (not yet validated) backend described by `spec`.
    pub fn build(&self, spec: &BackendSpec) -> Result<Box<dyn Backend>, ConfigError> {
        let constructor = self
            .constructors
            .get(&spec.kind)
            .ok_or_else(|| ConfigError::UnknownBackend(spec.kind.clone()))?;
        constructor(&spec.config)
    }

    /// Constructs all backends of a `dst_backend` mapping.
    pub fn build_all(&self, mapping: &Value) -> Result<Vec<Box<dyn Backend>>, ConfigError> {
        BackendSpec::from_mapping(mapping)?
            .iter()
            .map(|spec| self.build(spec))
            .collect()
    }
}
