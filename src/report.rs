//! Reporting of outcomes to the operator.
//!
//! Batch operations produce one [TaskOutcome] per task, rendered as text or
//! JSON. [ExitStatus] encodes the process exit policy:
//!
//! - configuration or validation problems exit with `2`,
//! - a failed one-shot operation (restore, download, delete) exits with `1`,
//! - a batch exits with `0` even when tasks or single backends failed while
//!   running; those failures are itemised in the report instead.

use std::fmt;
use std::process::ExitCode;

use chrono::{DateTime, Utc};

use crate::backends::RemoteObject;
use crate::task::archive::ArchiveName;
use crate::task::TaskError;

/// Final state of a task in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Succeeded,
    /// The task ran and failed.
    Failed,
    /// The task was rejected by configuration or validation.
    Rejected,
    /// The task type is unknown.
    Skipped,
}

/// Outcome of one task of a batch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TaskOutcome {
    pub name: String,
    pub status: Status,
    pub detail: String,
}

impl TaskOutcome {
    pub fn succeeded(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Status::Succeeded,
            detail: detail.into(),
        }
    }

    pub fn failed(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Status::Failed,
            detail: detail.into(),
        }
    }

    pub fn skipped(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Status::Skipped,
            detail: detail.into(),
        }
    }

    /// Outcome of a task that ended with `error`.
    pub fn from_error(name: impl Into<String>, error: &TaskError) -> Self {
        let status = match error {
            TaskError::Fields(_) | TaskError::Config(_) => Status::Rejected,
            TaskError::UnknownType(_) => Status::Skipped,
            _ => Status::Failed,
        };
        Self {
            name: name.into(),
            status,
            detail: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Succeeded
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { name, detail, .. } = self;
        match self.status {
            Status::Succeeded => write!(f, "Task {name}, finished: {detail}"),
            Status::Failed => write!(f, "Task {name} generated an error: {detail}"),
            Status::Rejected => write!(f, "Task {name} is invalid: {detail}"),
            Status::Skipped => write!(f, "Task {name} skipped: {detail}"),
        }
    }
}

/// Process exit policy, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitStatus {
    Success,
    /// A one-shot operation failed.
    Failure,
    /// Configuration or validation failed.
    Invalid,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Invalid => 2,
        }
    }

    /// Exit status of a batch: only rejected tasks make it fail.
    pub fn of_batch(outcomes: &[TaskOutcome]) -> Self {
        if outcomes.iter().any(|o| o.status == Status::Rejected) {
            Self::Invalid
        } else {
            Self::Success
        }
    }

    /// Exit status of a one-shot operation.
    pub fn of_error(error: &TaskError) -> Self {
        match TaskOutcome::from_error("", error).status {
            Status::Rejected | Status::Skipped => Self::Invalid,
            _ => Self::Failure,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

/// An object listed from a backend.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ListedObject {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Backup name and creation time if the name is an archive name.
    pub archive: Option<ArchiveName>,
}

impl From<RemoteObject> for ListedObject {
    fn from(object: RemoteObject) -> Self {
        Self {
            archive: ArchiveName::parse(&object.name),
            name: object.name,
            size: object.size,
            modified: object.modified,
        }
    }
}

/// Objects of one backend, newest first.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Listing {
    pub backend: String,
    pub objects: Vec<ListedObject>,
}

impl Listing {
    pub fn new(backend: String, objects: Vec<RemoteObject>) -> Self {
        let mut objects: Vec<ListedObject> = objects.into_iter().map(Into::into).collect();
        objects.sort_by(|a, b| b.modified.cmp(&a.modified));
        Self { backend, objects }
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.backend)?;
        for object in &self.objects {
            write!(
                f,
                "  {:<48} {:>12} {}",
                object.name,
                object.size,
                object.modified.format("%Y-%m-%d %H:%M:%S")
            )?;
            if let Some(archive) = &object.archive {
                write!(f, "  [{}]", archive.backup_name)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Renders `items` one per line, or as a JSON array.
pub fn render<T>(items: &[T], json: bool) -> Result<String, serde_json::Error>
where
    T: fmt::Display + serde::Serialize,
{
    if json {
        return serde_json::to_string_pretty(items);
    }
    Ok(items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n"))
}
