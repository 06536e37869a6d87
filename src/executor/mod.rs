//! Runs tasks in batches and performs one-shot operations on backends.
//!
//! Batches ([create](TaskExecutor::create), [prune](TaskExecutor::prune))
//! are spread over a bounded [WorkerPool]. Every task of a batch gets an
//! outcome: a failing or panicking task never stops its siblings. One-shot
//! operations run on the calling thread.

pub mod pool;

use std::path::{Path, PathBuf};

use chrono::Local;
use toml::Table;

use crate::backends::{Backend, BackendSpec, DeleteReport};
use crate::report::{Listing, TaskOutcome};
use crate::task::{task_label, RestoreReport, Task, TaskError, TaskRegistry};
use crate::util::retention::RetentionPeriod;
use pool::WorkerPool;

/// Default number of concurrently processed tasks or uploads.
pub const DEFAULT_WORKERS: usize = 2;

/// Operation applied to every task of a batch.
type BatchOperation = fn(&mut dyn Task) -> Result<String, TaskError>;

/// Dispatches task configurations to their task types and runs them.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    registry: TaskRegistry,
    pool: WorkerPool,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl TaskExecutor {
    /// Executor of the built-in task types running `workers` tasks at once.
    pub fn new(workers: usize) -> Self {
        Self::with_registry(TaskRegistry::default(), workers)
    }

    pub fn with_registry(registry: TaskRegistry, workers: usize) -> Self {
        Self {
            registry,
            pool: WorkerPool::new(workers),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn workers(&self) -> usize {
        self.pool.size()
    }

    /// Creates a backup for each of `tasks`.
    ///
    /// Outcomes are returned in completion order.
    pub fn create(&self, tasks: &[Table]) -> Vec<TaskOutcome> {
        log::info!(target: "executor", "Creating backups of {} task(s)", tasks.len());
        self.run_batch(tasks, |task| task.create().map(|report| report.to_string()))
    }

    /// Applies the retention period of each of `tasks`.
    pub fn prune(&self, tasks: &[Table]) -> Vec<TaskOutcome> {
        log::info!(target: "executor", "Pruning backups of {} task(s)", tasks.len());
        self.run_batch(tasks, |task| {
            Ok(match task.remove_old_files()? {
                Some(report) => report.to_string(),
                None => "no retention period".to_string(),
            })
        })
    }

    fn run_batch(&self, configs: &[Table], operation: BatchOperation) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::with_capacity(configs.len());
        let mut tasks = Vec::new();

        for config in configs {
            let label = task_label(config);
            match self.registry.create_task(config) {
                Ok(task) => tasks.push(task),
                Err(e @ TaskError::UnknownType(_)) => {
                    log::warn!(target: "executor", "Skipping task {label}: {e}");
                    outcomes.push(TaskOutcome::skipped(label, e.to_string()));
                }
                Err(e) => {
                    log::error!(target: "executor", "Task {label} generated an error: {e}");
                    outcomes.push(TaskOutcome::from_error(label, &e));
                }
            }
        }

        let names: Vec<String> = tasks.iter().map(|task| task.name().to_string()).collect();
        let jobs: Vec<_> = tasks
            .into_iter()
            .map(|mut task| move || operation(task.as_mut()))
            .collect();

        self.pool.execute(jobs, |index, result| {
            let name = &names[index];
            let outcome = match result {
                Ok(Ok(detail)) => {
                    log::info!(target: "executor", "Task {name}, finished: {detail}");
                    TaskOutcome::succeeded(name, detail)
                }
                Ok(Err(e)) => {
                    log::error!(target: "executor", "Task {name} generated an error: {e}");
                    TaskOutcome::from_error(name, &e)
                }
                Err(panic) => {
                    log::error!(target: "executor", "Task {name} generated an error: {panic}");
                    TaskOutcome::failed(name, panic.to_string())
                }
            };
            outcomes.push(outcome);
        });

        outcomes
    }

    /// Restores `backup`, or the latest backup, of the task `config`.
    ///
    /// The sources of the task may be missing.
    pub fn restore(&self, config: &Table, backup: Option<&str>) -> Result<RestoreReport, TaskError> {
        let mut task = self.registry.create_restore_task(config)?;
        let report = task.restore(backup)?;
        log::info!(target: "executor", "Task {}, finished: {report}", task.name());
        Ok(report)
    }

    /// Lists the objects stored by the backend `spec`.
    pub fn list(&self, spec: &BackendSpec) -> Result<Listing, TaskError> {
        let backend = self.open_backend(spec)?;
        let objects = backend.enumerate()?.collect::<Result<Vec<_>, _>>()?;
        Ok(Listing::new(backend.location(), objects))
    }

    /// Deletes the object `name` from the backend `spec`.
    pub fn delete(&self, spec: &BackendSpec, name: &str) -> Result<(), TaskError> {
        self.open_backend(spec)?.delete(name)?;
        Ok(())
    }

    /// Deletes every object older than `retention` from the backend `spec`.
    pub fn delete_older(
        &self,
        spec: &BackendSpec,
        retention: RetentionPeriod,
    ) -> Result<DeleteReport, TaskError> {
        let backend = self.open_backend(spec)?;
        let cutoff = retention.cutoff(Local::now().date_naive());
        log::info!(target: "executor", "Delete objects of {} older than {cutoff}", backend.location());
        Ok(backend.delete_older(cutoff)?)
    }

    /// Downloads the object `name` of the backend `spec` into `dst_dir`.
    pub fn download(
        &self,
        spec: &BackendSpec,
        name: &str,
        dst_dir: &Path,
    ) -> Result<PathBuf, TaskError> {
        let path = self.open_backend(spec)?.download(name, dst_dir, None)?;
        log::info!(target: "executor", "Downloaded {name} to {}", path.display());
        Ok(path)
    }

    fn open_backend(&self, spec: &BackendSpec) -> Result<Box<dyn Backend>, TaskError> {
        let mut backend = self.registry.backends().build(spec)?;
        backend.validate()?;
        Ok(backend)
    }
}
