#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sbackup_lib::backends::{
    Backend, BackendError, BackendRegistry, BackendResult, Objects,
};
use sbackup_lib::config::ConfigError;
use sbackup_lib::task::TaskRegistry;
use toml::{Table, Value};

pub const FLAKY: &str = "flaky";
pub const BROKEN: &str = "broken";

/// Backend accepting every check but failing every upload.
#[derive(Debug)]
pub struct FlakyBackend {
    validated: bool,
}

impl FlakyBackend {
    pub fn from_config(_config: &Table) -> Result<Box<dyn Backend>, ConfigError> {
        Ok(Box::new(Self { validated: false }))
    }
}

impl Backend for FlakyBackend {
    fn kind(&self) -> &'static str {
        FLAKY
    }

    fn location(&self) -> String {
        "flaky:".to_string()
    }

    fn validate(&mut self) -> BackendResult<()> {
        self.validated = true;
        Ok(())
    }

    fn is_validated(&self) -> bool {
        self.validated
    }

    fn list_objects(&self) -> BackendResult<Objects<'_>> {
        Ok(Box::new(std::iter::empty()))
    }

    fn put_object(&self, _src: &Path, _name: &str) -> BackendResult<()> {
        Err(io::Error::other("connection reset by peer").into())
    }

    fn get_object(&self, name: &str, _dst: &Path) -> BackendResult<()> {
        Err(BackendError::NotFound(name.to_string()))
    }

    fn remove_object(&self, name: &str) -> BackendResult<()> {
        Err(BackendError::NotFound(name.to_string()))
    }
}

/// Backend whose storage can't be listed.
#[derive(Debug)]
pub struct BrokenBackend {
    validated: bool,
}

impl BrokenBackend {
    pub fn from_config(_config: &Table) -> Result<Box<dyn Backend>, ConfigError> {
        Ok(Box::new(Self { validated: false }))
    }
}

impl Backend for BrokenBackend {
    fn kind(&self) -> &'static str {
        BROKEN
    }

    fn location(&self) -> String {
        "broken:".to_string()
    }

    fn validate(&mut self) -> BackendResult<()> {
        self.validated = true;
        Ok(())
    }

    fn is_validated(&self) -> bool {
        self.validated
    }

    fn list_objects(&self) -> BackendResult<Objects<'_>> {
        Err(io::Error::other("listing timed out").into())
    }

    fn put_object(&self, _src: &Path, _name: &str) -> BackendResult<()> {
        Err(io::Error::other("listing timed out").into())
    }

    fn get_object(&self, name: &str, _dst: &Path) -> BackendResult<()> {
        Err(BackendError::NotFound(name.to_string()))
    }

    fn remove_object(&self, name: &str) -> BackendResult<()> {
        Err(BackendError::NotFound(name.to_string()))
    }
}

/// Backend registry knowing `local`, [FlakyBackend] and [BrokenBackend].
pub fn backends() -> BackendRegistry {
    let mut registry = BackendRegistry::default();
    registry.register(FLAKY, FlakyBackend::from_config);
    registry.register(BROKEN, BrokenBackend::from_config);
    registry
}

pub fn tasks() -> TaskRegistry {
    TaskRegistry::with_backends(backends())
}

fn path_value(path: &Path) -> Value {
    Value::from(path.display().to_string())
}

/// `dst_backend` mapping with a `local` backend storing into `storage`.
pub fn local_backend(storage: &Path) -> Value {
    let mut local = Table::new();
    local.insert("path".to_string(), path_value(storage));
    let mut mapping = Table::new();
    mapping.insert("local".to_string(), Value::Table(local));
    Value::Table(mapping)
}

/// Adds the backend `kind` without settings to a `dst_backend` mapping.
fn with_kind(mut mapping: Value, kind: &str) -> Value {
    if let Value::Table(mapping) = &mut mapping {
        mapping.insert(kind.to_string(), Value::Table(Table::new()));
    }
    mapping
}

/// Adds the [FlakyBackend] to a `dst_backend` mapping.
pub fn with_flaky(mapping: Value) -> Value {
    with_kind(mapping, FLAKY)
}

/// Adds the [BrokenBackend] to a `dst_backend` mapping.
pub fn with_broken(mapping: Value) -> Value {
    with_kind(mapping, BROKEN)
}

pub fn flaky_backend() -> Value {
    with_flaky(Value::Table(Table::new()))
}

/// Configuration of a `dir` task.
pub fn dir_task(name: &str, sources: &[&Path], dst_backend: Value) -> Table {
    let mut task = Table::new();
    task.insert("name".to_string(), Value::from(name));
    task.insert("type".to_string(), Value::from("dir"));
    task.insert(
        "sources".to_string(),
        Value::Array(sources.iter().map(|s| path_value(s)).collect()),
    );
    task.insert("dst_backend".to_string(), dst_backend);
    task
}

pub fn set(task: &mut Table, key: &str, value: impl Into<Value>) {
    task.insert(key.to_string(), value.into());
}

pub fn set_path(task: &mut Table, key: &str, path: &Path) {
    task.insert(key.to_string(), path_value(path));
}

/// Writes a small site below `root` and returns its path.
pub fn write_site(root: &Path, name: &str) -> PathBuf {
    let site = root.join(name);
    fs::create_dir_all(site.join("assets/img")).unwrap();
    fs::write(site.join("index.html"), format!("<h1>{name}</h1>")).unwrap();
    fs::write(site.join("assets/style.css"), "body { margin: 0 }").unwrap();
    fs::write(site.join("assets/img/logo.svg"), "<svg/>").unwrap();
    site
}

/// Relative paths and contents of all files below `root`.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, files: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, files);
            } else {
                let relative = path.strip_prefix(root).unwrap().to_path_buf();
                files.insert(relative, fs::read(&path).unwrap());
            }
        }
    }

    let mut files = BTreeMap::new();
    walk(root, root, &mut files);
    files
}

/// Stores an object `name` in `storage` last modified `days` ago.
pub fn plant(storage: &Path, name: &str, days: u64) -> PathBuf {
    let path = storage.join(name);
    fs::write(&path, name).unwrap();
    let modified = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
    path
}

/// Names of the regular files in `dir`, sorted.
pub fn names(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
