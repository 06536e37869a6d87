use std::fmt;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use toml::Table;

use crate::backends::BackendSpec;
use crate::config::{Config, ConfigError};
use crate::executor::{TaskExecutor, DEFAULT_WORKERS};
use crate::report::{self, ExitStatus, TaskOutcome};
use crate::task::{task_label, TaskError};
use crate::util::retention::RetentionPeriod;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file listing the tasks.
    #[arg(
        long,
        short = 'c',
        env = "SBACKUP_CONFIG",
        default_value = "/etc/sbackup.toml",
        global = true
    )]
    pub config: PathBuf,

    /// A single task as TOML inline table. Takes precedence over --config.
    #[arg(long, short = 't', global = true)]
    pub task: Option<String>,

    /// Only use the task of this name.
    #[arg(long, short = 'n', global = true)]
    pub task_name: Option<String>,

    /// Number of tasks processed concurrently. Overrides the config file.
    #[arg(long, short = 'w', global = true)]
    pub workers: Option<usize>,

    /// Print reports as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Create a backup of every task.
    Create,
    /// List the stored backups of every task.
    List,
    /// Delete a stored backup or all backups older than some days.
    Delete(DeleteArgs),
    /// Restore the latest or the given backup of a task.
    Restore {
        /// Name of the stored backup.
        backup: Option<String>,
    },
    /// Download a stored backup of a task.
    Download {
        /// Name of the stored backup.
        backup: String,
        /// Directory to download into.
        dst_dir: PathBuf,
    },
    /// Delete the backups older than the retention period of every task.
    Prune,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct DeleteArgs {
    /// Name of the stored backup.
    pub backup: Option<String>,

    /// Delete all backups older than this number of days.
    #[arg(long)]
    pub older: Option<RetentionPeriod>,
}

impl Cli {
    fn load_config(&self) -> Result<Config, ConfigError> {
        match &self.task {
            Some(task) => Config::from_inline(task),
            None => Config::load(&self.config),
        }
    }
}

/// Runs the command line `cli` and returns the exit status of the process.
pub fn run(cli: Cli) -> ExitStatus {
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!(target: "config", "{e}");
            return ExitStatus::Invalid;
        }
    };
    let workers = cli.workers.or(config.workers).unwrap_or(DEFAULT_WORKERS);
    let executor = TaskExecutor::new(workers);
    let task_name = cli.task_name.as_deref();

    let result = match cli.action {
        Action::Create => config
            .select(task_name)
            .map(|tasks| batch(executor.create(&tasks), cli.json)),
        Action::Prune => config
            .select(task_name)
            .map(|tasks| batch(executor.prune(&tasks), cli.json)),
        Action::List => config
            .select(task_name)
            .map(|tasks| list(&executor, &tasks, cli.json)),
        Action::Delete(DeleteArgs {
            older: Some(retention),
            ..
        }) => config
            .select(task_name)
            .map(|tasks| delete_older(&executor, &tasks, retention, cli.json)),
        Action::Delete(DeleteArgs {
            backup: Some(backup),
            ..
        }) => config
            .select_one(task_name)
            .map(|task| delete(&executor, &task, &backup, cli.json)),
        Action::Delete(_) => unreachable!("clap requires a backup or --older"),
        Action::Restore { backup } => config
            .select_one(task_name)
            .map(|task| restore(&executor, &task, backup.as_deref(), cli.json)),
        Action::Download { backup, dst_dir } => config
            .select_one(task_name)
            .map(|task| download(&executor, &task, &backup, &dst_dir, cli.json)),
    };

    result.unwrap_or_else(|e| {
        log::error!(target: "config", "{e}");
        ExitStatus::Invalid
    })
}

fn print<T>(items: &[T], json: bool)
where
    T: fmt::Display + serde::Serialize,
{
    match report::render(items, json) {
        Ok(output) if output.is_empty() => {}
        Ok(output) => println!("{output}"),
        Err(e) => log::error!(target: "report", "Rendering the report failed: {e}"),
    }
}

fn batch(outcomes: Vec<TaskOutcome>, json: bool) -> ExitStatus {
    print(&outcomes, json);
    ExitStatus::of_batch(&outcomes)
}

fn backend_specs(task: &Table) -> Result<Vec<BackendSpec>, ExitStatus> {
    BackendSpec::from_task(task).map_err(|e| {
        log::error!(target: "config", "Task {}: {e}", task_label(task));
        ExitStatus::Invalid
    })
}

fn failure(label: String, error: &TaskError, status: &mut ExitStatus) -> TaskOutcome {
    log::error!(target: "cli", "{label}: {error}");
    *status = (*status).max(ExitStatus::of_error(error));
    TaskOutcome::from_error(label, error)
}

fn list(executor: &TaskExecutor, tasks: &[Table], json: bool) -> ExitStatus {
    let mut status = ExitStatus::Success;
    let mut listings = Vec::new();

    for task in tasks {
        let specs = match backend_specs(task) {
            Ok(specs) => specs,
            Err(e) => {
                status = status.max(e);
                continue;
            }
        };
        for spec in specs {
            match executor.list(&spec) {
                Ok(listing) => listings.push(listing),
                Err(e) => {
                    failure(format!("{} ({})", task_label(task), spec.kind), &e, &mut status);
                }
            }
        }
    }

    print(&listings, json);
    status
}

fn delete_older(
    executor: &TaskExecutor,
    tasks: &[Table],
    retention: RetentionPeriod,
    json: bool,
) -> ExitStatus {
    let mut status = ExitStatus::Success;
    let mut outcomes = Vec::new();

    for task in tasks {
        let specs = match backend_specs(task) {
            Ok(specs) => specs,
            Err(e) => {
                status = status.max(e);
                continue;
            }
        };
        for spec in specs {
            let label = format!("{} ({})", task_label(task), spec.kind);
            match executor.delete_older(&spec, retention) {
                Ok(report) if report.is_complete() => {
                    outcomes.push(TaskOutcome::succeeded(label, report.to_string()))
                }
                Ok(report) => {
                    status = status.max(ExitStatus::Failure);
                    outcomes.push(TaskOutcome::failed(label, report.to_string()));
                }
                Err(e) => outcomes.push(failure(label, &e, &mut status)),
            }
        }
    }

    print(&outcomes, json);
    status
}

fn delete(executor: &TaskExecutor, task: &Table, backup: &str, json: bool) -> ExitStatus {
    let specs = match backend_specs(task) {
        Ok(specs) => specs,
        Err(status) => return status,
    };
    let mut status = ExitStatus::Success;
    let mut outcomes = Vec::new();

    for spec in specs {
        let label = format!("{} ({})", task_label(task), spec.kind);
        match executor.delete(&spec, backup) {
            Ok(()) => outcomes.push(TaskOutcome::succeeded(label, format!("deleted {backup}"))),
            Err(e) => outcomes.push(failure(label, &e, &mut status)),
        }
    }

    print(&outcomes, json);
    status
}

fn restore(executor: &TaskExecutor, task: &Table, backup: Option<&str>, json: bool) -> ExitStatus {
    let label = task_label(task);
    let mut status = ExitStatus::Success;
    let outcome = match executor.restore(task, backup) {
        Ok(report) => TaskOutcome::succeeded(label, report.to_string()),
        Err(e) => failure(label, &e, &mut status),
    };

    print(&[outcome], json);
    status
}

fn download(
    executor: &TaskExecutor,
    task: &Table,
    backup: &str,
    dst_dir: &Path,
    json: bool,
) -> ExitStatus {
    let specs = match backend_specs(task) {
        Ok(specs) => specs,
        Err(status) => return status,
    };
    let mut status = ExitStatus::Success;
    let mut outcomes = Vec::new();

    // first backend holding the backup wins
    for spec in specs {
        let label = format!("{} ({})", task_label(task), spec.kind);
        match executor.download(&spec, backup, dst_dir) {
            Ok(path) => {
                let detail = format!("downloaded {backup} to {}", path.display());
                print(&[TaskOutcome::succeeded(label, detail)], json);
                return ExitStatus::Success;
            }
            Err(e) => outcomes.push(failure(label, &e, &mut status)),
        }
    }

    print(&outcomes, json);
    status
}
