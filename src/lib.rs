//! Library to archive files and directories and ship the archives to
//! pluggable storage backends.
//!
//! Backups are described by tasks (see [`task`]) read from a TOML
//! configuration (see [`config`]). The [`executor`] runs batches of tasks
//! concurrently and the storage destinations live in the [`backends`]
//! module.

#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod config;
pub mod executor;
pub mod report;
pub mod task;
pub mod util;
