mod common;

use std::fs;
use std::path::Path;

use clap::Parser;
use sbackup_lib::backends::BackendSpec;
use sbackup_lib::cli::{self, Cli};
use sbackup_lib::executor::TaskExecutor;
use sbackup_lib::report::{ExitStatus, Status};
use sbackup_lib::util::retention::RetentionPeriod;
use tempfile::tempdir;
use toml::Table;

use common::*;

fn local_spec(storage: &Path) -> BackendSpec {
    BackendSpec::from_mapping(&local_backend(storage))
        .unwrap()
        .remove(0)
}

#[test]
fn test_batch_completes_every_task_despite_failure() {
    let src = tempdir().unwrap();
    let storage = tempdir().unwrap();

    let mut configs: Vec<Table> = (0..5)
        .map(|i| {
            let name = format!("site{i}");
            let site = write_site(src.path(), &name);
            dir_task(&name, &[&site], local_backend(storage.path()))
        })
        .collect();
    configs[2] = dir_task("site2", &[&src.path().join("site2")], flaky_backend());

    let executor = TaskExecutor::with_registry(tasks(), 2);
    assert_eq!(executor.workers(), 2);
    let outcomes = executor.create(&configs);

    assert_eq!(outcomes.len(), 5);
    for outcome in &outcomes {
        if outcome.name == "site2" {
            assert_eq!(outcome.status, Status::Failed);
            assert!(outcome.detail.contains("failed on every backend"));
        } else {
            assert!(outcome.is_success(), "{outcome}");
        }
    }
    assert_eq!(names(storage.path()).len(), 4);
    assert_eq!(ExitStatus::of_batch(&outcomes), ExitStatus::Success);
}

#[test]
fn test_batch_skips_unknown_types() {
    let src = tempdir().unwrap();
    let storage = tempdir().unwrap();
    let site = write_site(src.path(), "site1");

    let mut database = dir_task("db", &[&site], local_backend(storage.path()));
    set(&mut database, "type", "mysql");
    let configs = [database, dir_task("site1", &[&site], local_backend(storage.path()))];

    let outcomes = TaskExecutor::default().create(&configs);
    let skipped: Vec<_> = outcomes
        .iter()
        .filter(|o| o.status == Status::Skipped)
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].name, "db");
    assert_eq!(skipped[0].detail, "Can't work with backup's type mysql");
    assert_eq!(ExitStatus::of_batch(&outcomes), ExitStatus::Success);
}

#[test]
fn test_prune_applies_each_retention_period() {
    let src = tempdir().unwrap();
    let storage = tempdir().unwrap();
    let site = write_site(src.path(), "site1");
    plant(storage.path(), "backup-site1-2020-01-01-00-00.tar.gz", 40);
    plant(storage.path(), "backup-keep-2020-01-01-00-00.tar.gz", 40);

    let mut pruned = dir_task("site1", &[&site], local_backend(storage.path()));
    set(&mut pruned, "retention_period", 30i64);
    let kept = dir_task("keep", &[&site], local_backend(storage.path()));

    let outcomes = TaskExecutor::default().prune(&[pruned, kept]);
    assert!(outcomes.iter().all(|o| o.is_success()));
    let kept = outcomes.iter().find(|o| o.name == "keep").unwrap();
    assert_eq!(kept.detail, "no retention period");
    assert_eq!(names(storage.path()), ["backup-keep-2020-01-01-00-00.tar.gz"]);
}

#[test]
fn test_delete_older_is_idempotent() {
    let storage = tempdir().unwrap();
    plant(storage.path(), "old.tar.gz", 9);
    plant(storage.path(), "recent.tar.gz", 2);
    let spec = local_spec(storage.path());
    let executor = TaskExecutor::default();
    let retention = RetentionPeriod::days(7).unwrap();

    let first = executor.delete_older(&spec, retention).unwrap();
    assert_eq!(first.deleted, ["old.tar.gz"]);
    let after_first = names(storage.path());

    let second = executor.delete_older(&spec, retention).unwrap();
    assert!(second.deleted.is_empty());
    assert!(second.is_complete());
    assert_eq!(names(storage.path()), after_first);
    assert_eq!(after_first, ["recent.tar.gz"]);
}

#[test]
fn test_restore_latest_backup_through_executor() {
    let src = tempdir().unwrap();
    let storage = tempdir().unwrap();
    let site = write_site(src.path(), "site1");
    let original = snapshot(&site);
    let config = dir_task("site1", &[&site], local_backend(storage.path()));
    let executor = TaskExecutor::default();

    assert!(executor.create(&[config.clone()])[0].is_success());
    fs::remove_dir_all(&site).unwrap();
    assert_eq!(executor.create(&[config.clone()])[0].status, Status::Rejected);

    let report = executor.restore(&config, None).unwrap();
    assert_eq!(report.restored, [site.clone()]);
    assert_eq!(snapshot(&site), original);
}

fn write_config(dir: &Path, tasks: &[Table]) -> String {
    let mut document = Table::new();
    document.insert(
        "task".to_string(),
        tasks.iter().cloned().map(toml::Value::Table).collect::<Vec<_>>().into(),
    );
    let path = dir.join("sbackup.toml");
    fs::write(&path, toml::to_string(&document).unwrap()).unwrap();
    path.display().to_string()
}

fn run(args: &[&str]) -> ExitStatus {
    let cli = Cli::try_parse_from(std::iter::once("sbackup").chain(args.iter().copied())).unwrap();
    cli::run(cli)
}

fn run_site1<'a>(config: &'a str, args: &[&'a str]) -> ExitStatus {
    let mut args = args.to_vec();
    args.extend(["--config", config, "--task-name", "site1"]);
    run(&args)
}

#[test]
fn test_cli_exit_policy() {
    let src = tempdir().unwrap();
    let storage = tempdir().unwrap();
    let site = write_site(src.path(), "site1");

    let mut unknown = dir_task("db", &[&site], local_backend(storage.path()));
    set(&mut unknown, "type", "mysql");
    let config = write_config(
        src.path(),
        &[dir_task("site1", &[&site], local_backend(storage.path())), unknown],
    );
    assert_eq!(run(&["create", "--config", &config]), ExitStatus::Success);
    assert_eq!(names(storage.path()).len(), 1);

    let download = tempdir().unwrap();
    let download_dir = download.path().display().to_string();
    let archive = names(storage.path()).remove(0);
    assert_eq!(run_site1(&config, &["download", &archive, &download_dir]), ExitStatus::Success);
    assert_eq!(names(download.path()), [archive.clone()]);
    assert_eq!(
        run_site1(&config, &["download", "missing.tar.gz", &download_dir]),
        ExitStatus::Failure
    );

    assert_eq!(run_site1(&config, &["delete", &archive]), ExitStatus::Success);
    assert_eq!(run_site1(&config, &["delete", &archive]), ExitStatus::Failure);
    assert_eq!(run_site1(&config, &["restore"]), ExitStatus::Failure);
    assert_eq!(run(&["restore", "--config", &config]), ExitStatus::Invalid);

    let mut broken = dir_task("broken", &[&site], local_backend(storage.path()));
    broken.remove("sources");
    let config = write_config(src.path(), &[broken]);
    assert_eq!(run(&["create", "--config", &config]), ExitStatus::Invalid);
    assert_eq!(ExitStatus::Invalid.code(), 2);
}

#[test]
fn test_cli_inline_task() {
    let src = tempdir().unwrap();
    let storage = tempdir().unwrap();
    let site = write_site(src.path(), "site1");

    let inline = format!(
        r#"{{ name = "site1", type = "dir", source = "{}", dst_backend = {{ local = {{ path = "{}" }} }} }}"#,
        site.display(),
        storage.path().display()
    );
    assert_eq!(run(&["create", "--task", &inline, "--json"]), ExitStatus::Success);
    assert_eq!(run(&["list", "--task", &inline]), ExitStatus::Success);
    assert_eq!(run(&["delete", "--older", "1", "--task", &inline]), ExitStatus::Success);
    assert_eq!(names(storage.path()).len(), 1);
}
