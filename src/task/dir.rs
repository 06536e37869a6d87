//! Implements backups of files and directories using [DirTask].

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use derive_more::Display;
use tempfile::TempDir;
use toml::{Table, Value};

use super::archive::{self, ArchiveName, PackagingError};
use super::schema::{Field, FieldErrors, Schema, Validator};
use super::{CreateReport, Purpose, RestoreReport, Task, TaskError};
use crate::backends::{Backend, BackendError, BackendRegistry, DeleteReport, RemoteObject, BACKEND_KEYS};
use crate::executor::pool::WorkerPool;
use crate::executor::DEFAULT_WORKERS;
use crate::util::{self, retention::RetentionPeriod};

/// Type tag of the [DirTask].
pub const TYPE: &str = "dir";

/// Configuration fields of a [DirTask] backing up its sources.
pub static SCHEMA: Schema = Schema::new(&BACKUP_FIELDS);

/// Configuration fields of a [DirTask] restoring over its sources.
///
/// The sources may be missing but have to be placed in writable directories.
pub static RESTORE_SCHEMA: Schema = Schema::new(&RESTORE_FIELDS);

const BACKUP_FIELDS: [Field; 6] = fields(validate_sources);
const RESTORE_FIELDS: [Field; 6] = fields(validate_restore_targets);

const fn fields(sources: Validator) -> [Field; 6] {
    [
        Field::required("name").validate_with(validate_name),
        Field::required("sources")
            .aliases(&["source", "source_dirs"])
            .validate_with(sources),
        Field::required(BACKEND_KEYS[0])
            .aliases(&["dst_backends"])
            .validate_with(validate_backend_mapping),
        Field::optional("backup_name")
            .default_with(default_backup_name)
            .validate_with(validate_name),
        Field::optional("tmp_dir").validate_with(validate_tmp_dir),
        Field::optional("retention_period").validate_with(validate_retention_period),
    ]
}

fn schema(purpose: Purpose) -> &'static Schema {
    match purpose {
        Purpose::Backup => &SCHEMA,
        Purpose::Restore => &RESTORE_SCHEMA,
    }
}

/// Lifecycle of a [DirTask].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TaskState {
    #[display("unvalidated")]
    Unvalidated,
    #[display("validated")]
    Validated,
    #[display("packaged")]
    Packaged,
    #[display("uploaded")]
    Uploaded,
    #[display("restored")]
    Restored,
}

/// The [DirTask] archives a set of files and directories.
///
/// The archive `<backup_name>-<YYYY-MM-DD-HH-MM>.tar.gz` is built in a
/// temporary directory owned by the task and uploaded to all destination
/// backends concurrently. The temporary directory is removed on every path
/// out of [create](Task::create) and [restore](Task::restore).
#[derive(Debug)]
pub struct DirTask {
    name: String,
    sources: Vec<PathBuf>,
    backends: Vec<Box<dyn Backend>>,
    backup_name: String,
    tmp_dir: Option<PathBuf>,
    retention: Option<RetentionPeriod>,
    upload_workers: usize,
    purpose: Purpose,
    state: TaskState,
}

fn validate_name(value: &Value) -> Result<(), String> {
    parse_name(value).map(drop)
}

fn parse_name(value: &Value) -> Result<String, String> {
    let name = value
        .as_str()
        .ok_or_else(|| format!("The name has to be a string, got {}", value.type_str()))?;
    if name.contains(['/', '\\']) {
        return Err(format!("The name {name} must not contain path separators"));
    }
    Ok(name.to_string())
}

fn default_backup_name(config: &Table) -> Option<Value> {
    let name = config.get("name")?.as_str()?;
    Some(Value::from(format!("backup-{name}")))
}

fn validate_sources(value: &Value) -> Result<(), String> {
    check_each_source(value, check_source)
}

fn validate_restore_targets(value: &Value) -> Result<(), String> {
    check_each_source(value, check_restore_target)
}

/// Applies `check` to every source and rejects duplicate entry names.
fn check_each_source(value: &Value, check: fn(&Path) -> Result<(), String>) -> Result<(), String> {
    let sources = parse_sources(value)?;
    let mut problems = Vec::new();
    let mut names = HashSet::new();

    for source in &sources {
        if let Err(problem) = check(source) {
            problems.push(problem);
        } else if let Some(name) = archive::entry_name(source) {
            if !names.insert(name) {
                problems.push(format!(
                    "The sources contain {} more than once",
                    name.to_string_lossy()
                ));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

fn parse_sources(value: &Value) -> Result<Vec<PathBuf>, String> {
    match value {
        Value::String(source) => Ok(vec![PathBuf::from(source)]),
        Value::Array(sources) => sources
            .iter()
            .map(|source| {
                source
                    .as_str()
                    .map(PathBuf::from)
                    .ok_or_else(|| format!("A source has to be a path, got {source}"))
            })
            .collect(),
        other => Err(format!(
            "The sources have to be a list, got {}",
            other.type_str()
        )),
    }
}

fn check_source(source: &Path) -> Result<(), String> {
    let metadata = fs::metadata(source)
        .map_err(|e| format!("Can't find a path {}: {e}", source.display()))?;
    let readable = if metadata.is_dir() {
        fs::read_dir(source).map(drop)
    } else {
        fs::File::open(source).map(drop)
    };
    readable.map_err(|e| format!("The path {} is not readable: {e}", source.display()))?;

    if archive::entry_name(source).is_none() {
        return Err(format!("The path {} has no file name", source.display()));
    }
    Ok(())
}

/// A restore target may be missing, its parent has to be a writable directory.
fn check_restore_target(target: &Path) -> Result<(), String> {
    if archive::entry_name(target).is_none() {
        return Err(format!("The path {} has no file name", target.display()));
    }
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => check_writable_dir(parent),
        _ => check_writable_dir(Path::new(".")),
    }
}

fn check_writable_dir(dir: &Path) -> Result<(), String> {
    let metadata = fs::metadata(dir)
        .map_err(|e| format!("Can't find a directory {}: {e}", dir.display()))?;
    if !metadata.is_dir() {
        return Err(format!("{} is not a directory", dir.display()));
    }
    util::ensure_writable(dir)
        .map_err(|e| format!("The directory {} is not writable: {e}", dir.display()))
}

fn validate_backend_mapping(value: &Value) -> Result<(), String> {
    let mapping = value
        .as_table()
        .ok_or_else(|| format!("The dst_backend has to be a table, got {}", value.type_str()))?;
    for (kind, config) in mapping {
        if !config.is_table() {
            return Err(format!("The {kind} backend configuration has to be a table"));
        }
    }
    Ok(())
}

fn validate_tmp_dir(value: &Value) -> Result<(), String> {
    check_writable_dir(&parse_path(value)?)
}

fn parse_path(value: &Value) -> Result<PathBuf, String> {
    value
        .as_str()
        .map(PathBuf::from)
        .ok_or_else(|| format!("Expected a path, got {}", value.type_str()))
}

fn validate_retention_period(value: &Value) -> Result<(), String> {
    parse_retention_period(value).map(drop)
}

fn parse_retention_period(value: &Value) -> Result<RetentionPeriod, String> {
    value
        .clone()
        .try_into()
        .map_err(|e: toml::de::Error| e.message().to_string())
}

/// Converts an already validated value.
fn typed<T>(
    values: &Table,
    field: &str,
    parse: fn(&Value) -> Result<T, String>,
) -> Result<Option<T>, FieldErrors> {
    values
        .get(field)
        .map(|value| {
            parse(value).map_err(|message| {
                let mut errors = FieldErrors::default();
                errors.invalid(field, message);
                errors
            })
        })
        .transpose()
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, FieldErrors> {
    value.ok_or_else(|| {
        let mut errors = FieldErrors::default();
        errors.missing(field);
        errors
    })
}

impl DirTask {
    /// Builds a task from `config`, resolving backends with `registry`.
    ///
    /// All field problems are reported together.
    pub fn create_task(config: &Table, registry: &BackendRegistry) -> Result<Self, TaskError> {
        Self::create_task_for(config, registry, Purpose::Backup)
    }

    /// Builds a task for restoring, accepting sources that no longer exist.
    pub fn create_restore_task(
        config: &Table,
        registry: &BackendRegistry,
    ) -> Result<Self, TaskError> {
        Self::create_task_for(config, registry, Purpose::Restore)
    }

    fn create_task_for(
        config: &Table,
        registry: &BackendRegistry,
        purpose: Purpose,
    ) -> Result<Self, TaskError> {
        let (values, mut errors) = schema(purpose).read(config);

        let backends = match values.get(BACKEND_KEYS[0]) {
            Some(mapping) => match registry.build_all(mapping) {
                Ok(backends) => backends,
                Err(e) => {
                    errors.configuration(BACKEND_KEYS[0], e.to_string());
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if !errors.is_empty() {
            log::error!(target: "task::dir", "Invalid task {}: {errors}", super::task_label(config));
            return Err(errors.into());
        }

        let name = required(typed(&values, "name", parse_name)?, "name")?;
        let task = Self {
            sources: required(typed(&values, "sources", parse_sources)?, "sources")?,
            backup_name: typed(&values, "backup_name", parse_name)?
                .unwrap_or_else(|| format!("backup-{name}")),
            tmp_dir: typed(&values, "tmp_dir", parse_path)?,
            retention: typed(&values, "retention_period", parse_retention_period)?,
            name,
            backends,
            upload_workers: DEFAULT_WORKERS,
            purpose,
            state: TaskState::Unvalidated,
        };
        log::debug!(target: "task::dir", "Created {purpose} task {} with {} backend(s)", task.name, task.backends.len());

        Ok(task)
    }

    /// [TaskConstructor](super::TaskConstructor) registered for [TYPE].
    pub fn boxed(
        config: &Table,
        registry: &BackendRegistry,
        purpose: Purpose,
    ) -> Result<Box<dyn Task>, TaskError> {
        Ok(Box::new(Self::create_task_for(config, registry, purpose)?))
    }

    /// Uploads to at most `workers` backends at once.
    pub fn with_upload_workers(mut self, workers: usize) -> Self {
        self.upload_workers = workers;
        self
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn backup_name(&self) -> &str {
        &self.backup_name
    }

    pub fn retention(&self) -> Option<RetentionPeriod> {
        self.retention
    }

    pub fn backends(&self) -> &[Box<dyn Backend>] {
        &self.backends
    }

    /// Prefix shared by all archive names of this task.
    fn archive_prefix(&self) -> String {
        format!("{}-", self.backup_name)
    }

    /// Returns if `name` is an archive of this task. Archives of a task whose
    /// backup name merely starts with this one's don't count.
    fn owns(&self, name: &str) -> bool {
        ArchiveName::parse(name).is_some_and(|archive| archive.backup_name == self.backup_name)
    }

    /// Validates the fields as needed for `purpose` and every backend.
    fn validate_for(&mut self, purpose: Purpose) -> Result<(), TaskError> {
        let mut errors = self.validate_fields(purpose);
        errors.extend(self.validate_backends());
        errors.into_result(())?;

        if self.state == TaskState::Unvalidated {
            self.state = TaskState::Validated;
        }
        Ok(())
    }

    fn validate_fields(&self, purpose: Purpose) -> FieldErrors {
        let mut values = Table::new();
        let sources = self
            .sources
            .iter()
            .map(|source| Value::from(source.display().to_string()))
            .collect::<Vec<_>>();
        values.insert("sources".to_string(), Value::from(sources));
        if let Some(tmp_dir) = &self.tmp_dir {
            values.insert(
                "tmp_dir".to_string(),
                Value::from(tmp_dir.display().to_string()),
            );
        }
        schema(purpose).revalidate(&values)
    }

    fn validate_backends(&mut self) -> FieldErrors {
        let mut errors = FieldErrors::default();
        for backend in &mut self.backends {
            if let Err(e) = backend.validate() {
                log::error!(target: "task::dir", "Backend {} of {} is unusable: {e}", backend.location(), self.name);
                errors.invalid(BACKEND_KEYS[0], format!("{}: {e}", backend.location()));
            }
        }
        errors
    }

    fn scoped_tmp_dir(&self) -> Result<TempDir, TaskError> {
        let prefix = self.archive_prefix();
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let tmp = match &self.tmp_dir {
            Some(tmp_dir) => builder.tempdir_in(tmp_dir),
            None => builder.tempdir(),
        }
        .map_err(TaskError::TempDir)?;

        log::trace!(target: "task::dir", "Created temporary directory {}", tmp.path().display());
        Ok(tmp)
    }

    fn upload_all(&self, archive: &Path, archive_name: &str) -> CreateReport {
        let mut report = CreateReport {
            archive: archive_name.to_string(),
            uploaded: Vec::new(),
            failed: Vec::new(),
        };

        let jobs: Vec<_> = self
            .backends
            .iter()
            .map(|backend| {
                let backend: &dyn Backend = backend.as_ref();
                move || backend.upload(archive)
            })
            .collect();

        WorkerPool::new(self.upload_workers).execute(jobs, |index, result| {
            let location = self.backends[index].location();
            match result {
                Ok(Ok(_)) => report.uploaded.push(location),
                Ok(Err(e)) => {
                    log::error!(target: "task::dir", "Upload of {archive_name} to {location} failed: {e}");
                    report.failed.push((location, e));
                }
                Err(panic) => {
                    log::error!(target: "task::dir", "Upload of {archive_name} to {location} failed: {panic}");
                    report.failed.push((location, io::Error::other(panic).into()));
                }
            }
        });

        report
    }

    /// Finds `backup`, or the latest backup of this task, on the backends.
    ///
    /// A backend that can't be searched is skipped. Its error is returned
    /// only if no other backend holds the backup.
    fn locate(&self, backup: Option<&str>) -> Result<(&dyn Backend, RemoteObject), TaskError> {
        let mut found: Option<(&dyn Backend, RemoteObject)> = None;
        let mut last_error: Option<BackendError> = None;

        for backend in &self.backends {
            let candidate = match backup {
                Some(name) => backend.find(name),
                None => backend.last_backup_matching(&|name| self.owns(name)),
            };
            let candidate = match candidate {
                Ok(Some(candidate)) => candidate,
                Ok(None) => continue,
                Err(e) => {
                    log::error!(target: "task::dir", "Can't search {} for backups of {}: {e}", backend.location(), self.name);
                    last_error = Some(e);
                    continue;
                }
            };
            if backup.is_some() {
                return Ok((backend.as_ref(), candidate));
            }
            if found
                .as_ref()
                .is_none_or(|(_, object)| candidate.modified > object.modified)
            {
                found = Some((backend.as_ref(), candidate));
            }
        }

        match (found, last_error) {
            (Some(found), _) => Ok(found),
            (None, Some(e)) => Err(e.into()),
            (None, None) => Err(TaskError::NoBackup(
                backup.map_or_else(|| self.archive_prefix(), str::to_string),
            )),
        }
    }

    fn close(tmp: TempDir) {
        let path = tmp.path().to_path_buf();
        if let Err(e) = tmp.close() {
            log::warn!(target: "task::dir", "Can't remove temporary directory {}: {e}", path.display());
        }
    }
}

impl Task for DirTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&mut self) -> Result<(), TaskError> {
        self.validate_for(self.purpose)
    }

    fn create(&mut self) -> Result<CreateReport, TaskError> {
        self.validate_for(Purpose::Backup)?;
        log::info!(target: "task::dir", "Create backup of task {}", self.name);

        let tmp = self.scoped_tmp_dir()?;
        let archive_name = archive::archive_name(&self.backup_name, Local::now());
        for backend in &self.backends {
            if backend.contains(&archive_name)? {
                log::error!(target: "task::dir", "{archive_name} already exists on {}", backend.location());
                return Err(PackagingError::Collision(archive_name).into());
            }
        }

        let archive = tmp.path().join(&archive_name);
        archive::pack(&self.sources, &archive)?;
        self.state = TaskState::Packaged;
        log::debug!(target: "task::dir", "Packaged {} source(s) into {archive_name}", self.sources.len());

        let report = self.upload_all(&archive, &archive_name);
        Self::close(tmp);

        if report.uploaded.is_empty() {
            return Err(TaskError::UploadFailed {
                archive: report.archive,
                failures: report.failed,
            });
        }
        self.state = TaskState::Uploaded;
        log::info!(target: "task::dir", "Finished backup of task {}: {report}", self.name);

        Ok(report)
    }

    fn restore(&mut self, backup: Option<&str>) -> Result<RestoreReport, TaskError> {
        self.validate_for(Purpose::Restore)?;
        let (backend, object) = self.locate(backup)?;
        log::info!(target: "task::dir", "Restore {} of task {} from {}", object.name, self.name, backend.location());

        let tmp = self.scoped_tmp_dir()?;
        let archive = backend.download(&object.name, tmp.path(), None)?;

        let staging = tmp.path().join("staging");
        let restore_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| TaskError::Restore { path, source }
        };
        fs::create_dir(&staging).map_err(restore_error(&staging))?;
        archive::unpack(&archive, &staging).map_err(restore_error(&archive))?;

        let mut restored = Vec::new();
        for source in &self.sources {
            let Some(entry) = archive::entry_name(source) else {
                continue;
            };
            let staged = staging.join(entry);
            if !staged.exists() {
                return Err(TaskError::Restore {
                    path: source.clone(),
                    source: io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{} is missing in {}", entry.to_string_lossy(), object.name),
                    ),
                });
            }
            archive::replace_with(&staged, source).map_err(restore_error(source))?;
            log::debug!(target: "task::dir", "Restored {}", source.display());
            restored.push(source.clone());
        }

        let report = RestoreReport {
            archive: object.name,
            backend: backend.location(),
            restored,
        };
        Self::close(tmp);
        self.state = TaskState::Restored;

        Ok(report)
    }

    fn remove_old_files(&mut self) -> Result<Option<DeleteReport>, TaskError> {
        let Some(retention) = self.retention else {
            log::debug!(target: "task::dir", "Task {} has no retention period", self.name);
            return Ok(None);
        };
        self.validate_backends().into_result(())?;

        let cutoff = retention.cutoff(Local::now().date_naive());
        log::info!(target: "task::dir", "Delete backups of task {} older than {cutoff}", self.name);

        let owned = |name: &str| self.owns(name);
        let mut report = DeleteReport::default();
        for backend in &self.backends {
            match backend.delete_older_matching(cutoff, &owned) {
                Ok(deleted) => report.merge(deleted),
                Err(e) => {
                    log::error!(target: "task::dir", "Retention on {} failed: {e}", backend.location());
                    report.failed.push((backend.location(), e));
                }
            }
        }

        Ok(Some(report))
    }
}
