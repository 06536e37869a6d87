//! Implements storage of archives in a local directory using [Local].

use std::fs::{self, DirEntry};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use toml::{Table, Value};

use super::{scoped_path, Backend, BackendError, BackendResult, Objects, RemoteObject, SecurityError};
use crate::config::ConfigError;
use crate::util;

/// Type tag of the [Local] backend.
pub const KIND: &str = "local";

const PART_SUFFIX: &str = ".part";

/// The [Local] backend keeps archives in a directory, e.g. a mounted NAS share.
///
/// The storage `path` plays the role of a bucket: it has to exist. The
/// optional `prefix` selects a namespace below it which is created on demand,
/// so one directory can serve several tasks.
///
/// ```toml
/// [task.dst_backend.local]
/// path = "/srv/backup"
/// prefix = "site1"
/// ```
#[derive(Debug)]
pub struct Local {
    root: PathBuf,
    namespace: PathBuf,
    validated: bool,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct LocalConfig {
    path: PathBuf,
    #[serde(default)]
    prefix: Option<String>,
}

impl Local {
    /// Create a new [Local] instance storing objects in `root`/`prefix`.
    pub fn new(root: impl Into<PathBuf>, prefix: Option<&str>) -> Result<Self, SecurityError> {
        let root = root.into();
        if root.is_relative() {
            log::warn!(target: "backend::local", "Storage path is relative: {}", root.display());
        }
        let namespace = match prefix {
            Some(prefix) => scoped_path(&root, prefix)?,
            None => root.clone(),
        };

        Ok(Self {
            root,
            namespace,
            validated: false,
        })
    }

    /// Constructor registered in the [BackendRegistry](super::BackendRegistry).
    pub fn from_config(config: &Table) -> Result<Box<dyn Backend>, ConfigError> {
        let config: LocalConfig = Value::Table(config.clone()).try_into().map_err(
            |e: toml::de::Error| ConfigError::InvalidBackend {
                kind: KIND.to_string(),
                reason: e.message().to_string(),
            },
        )?;

        let backend = Self::new(config.path, config.prefix.as_deref())?;
        Ok(Box::new(backend))
    }

    /// Directory holding the objects.
    pub fn namespace(&self) -> &Path {
        &self.namespace
    }

    fn object_path(&self, name: &str) -> Result<PathBuf, SecurityError> {
        scoped_path(&self.namespace, name)
    }
}

fn remote_object(entry: io::Result<DirEntry>) -> BackendResult<Option<RemoteObject>> {
    let entry = entry?;
    let Some(name) = entry.file_name().to_str().map(str::to_string) else {
        log::warn!(target: "backend::local", "Skipping non UTF-8 name: {}", entry.path().display());
        return Ok(None);
    };
    // hidden files are incomplete uploads or foreign
    if name.starts_with('.') {
        return Ok(None);
    }

    let metadata = entry.metadata()?;
    if !metadata.is_file() {
        return Ok(None);
    }

    Ok(Some(RemoteObject {
        name,
        size: metadata.len(),
        modified: DateTime::<Utc>::from(metadata.modified()?),
    }))
}

impl Backend for Local {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn location(&self) -> String {
        format!("{KIND}:{}", self.namespace.display())
    }

    fn validate(&mut self) -> BackendResult<()> {
        let metadata = fs::metadata(&self.root).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BackendError::Validation(format!(
                "The directory {} does not exist",
                self.root.display()
            )),
            _ => BackendError::Validation(format!(
                "Can't work with the directory {}, error: {e}",
                self.root.display()
            )),
        })?;
        if !metadata.is_dir() {
            return Err(BackendError::Validation(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        util::ensure_writable(&self.root).map_err(|e| {
            BackendError::Validation(format!(
                "The directory {} is not writable, error: {e}",
                self.root.display()
            ))
        })?;

        fs::create_dir_all(&self.namespace).map_err(|e| {
            BackendError::Validation(format!(
                "Can't create the namespace {}, error: {e}",
                self.namespace.display()
            ))
        })?;

        self.validated = true;
        log::debug!(target: "backend::local", "Validated {}", self.location());
        Ok(())
    }

    fn is_validated(&self) -> bool {
        self.validated
    }

    fn list_objects(&self) -> BackendResult<Objects<'_>> {
        let entries = match fs::read_dir(&self.namespace) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Box::new(std::iter::empty())),
            Err(e) => return Err(e.into()),
        };

        Ok(Box::new(
            entries.filter_map(|entry| remote_object(entry).transpose()),
        ))
    }

    fn put_object(&self, src: &Path, name: &str) -> BackendResult<()> {
        let dst = self.object_path(name)?;
        let Some(filename) = dst.file_name().and_then(|f| f.to_str()) else {
            return Err(SecurityError {
                name: name.to_string(),
                root: self.namespace.clone(),
            }
            .into());
        };
        let part = dst.with_file_name(format!(".{filename}{PART_SUFFIX}"));
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }

        log::trace!(target: "backend::local", "Copy {} to {}", src.display(), part.display());
        let copied = fs::copy(src, &part).and_then(|_| fs::rename(&part, &dst));
        if let Err(e) = copied {
            if let Err(cleanup) = fs::remove_file(&part) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    log::warn!(target: "backend::local", "Can't remove {}: {cleanup}", part.display());
                }
            }
            return Err(e.into());
        }

        Ok(())
    }

    fn get_object(&self, name: &str, dst: &Path) -> BackendResult<()> {
        let src = self.object_path(name)?;
        if !src.is_file() {
            return Err(BackendError::NotFound(name.to_string()));
        }

        fs::copy(&src, dst)?;
        Ok(())
    }

    fn remove_object(&self, name: &str) -> BackendResult<()> {
        let path = self.object_path(name)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BackendError::NotFound(name.to_string()),
            _ => BackendError::Io(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn validated(root: &Path, prefix: Option<&str>) -> Local {
        let mut backend = Local::new(root, prefix).unwrap();
        backend.validate().unwrap();
        backend
    }

    #[test]
    fn validate_reports_missing_directory() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let mut backend = Local::new(&missing, None).unwrap();

        let err = backend.validate().unwrap_err();
        assert!(matches!(&err, BackendError::Validation(msg) if msg.contains("does not exist")));
        assert!(err.to_string().contains(&missing.display().to_string()));
        assert!(!backend.is_validated());
    }

    #[test]
    fn validate_rejects_file_root() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();

        let mut backend = Local::new(&file, None).unwrap();
        assert!(matches!(backend.validate(), Err(BackendError::Validation(_))));
    }

    #[test]
    fn upload_enumerate_download_delete() {
        let storage = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let backend = validated(storage.path(), Some("site1"));

        let src = scratch.path().join("backup-site1-2024-01-01-00-00.tar.gz");
        fs::write(&src, b"archive").unwrap();

        let name = backend.upload(&src).unwrap();
        assert_eq!(name, "backup-site1-2024-01-01-00-00.tar.gz");
        assert!(storage.path().join("site1").join(&name).is_file());

        let objects: Vec<_> = backend.enumerate().unwrap().map(Result::unwrap).collect();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name, name);
        assert_eq!(objects[0].size, 7);

        let out = tempdir().unwrap();
        let path = backend.download(&name, out.path(), Some("copy.tar.gz")).unwrap();
        assert_eq!(path, out.path().join("copy.tar.gz"));
        assert_eq!(fs::read(&path).unwrap(), b"archive");

        backend.delete(&name).unwrap();
        assert_eq!(backend.enumerate().unwrap().count(), 0);
        assert!(matches!(backend.delete(&name), Err(BackendError::NotFound(_))));
    }

    #[test]
    fn enumerate_skips_hidden_and_directories() {
        let storage = tempdir().unwrap();
        fs::write(storage.path().join(".half.part"), b"").unwrap();
        fs::create_dir(storage.path().join("nested")).unwrap();
        fs::write(storage.path().join("a.tar.gz"), b"").unwrap();
        let backend = validated(storage.path(), None);

        let names: Vec<_> = backend
            .enumerate()
            .unwrap()
            .map(|o| o.unwrap().name)
            .collect();
        assert_eq!(names, ["a.tar.gz"]);
    }

    #[test]
    fn upload_of_missing_source_fails() {
        let storage = tempdir().unwrap();
        let backend = validated(storage.path(), None);

        let err = backend.upload(&storage.path().join("ghost")).unwrap_err();
        assert!(matches!(err, BackendError::MissingSource(_)));
    }

    #[test]
    fn download_checks_destination_and_existence() {
        let storage = tempdir().unwrap();
        let backend = validated(storage.path(), None);
        fs::write(storage.path().join("a"), b"a").unwrap();

        let err = backend
            .download("a", &storage.path().join("missing"), None)
            .unwrap_err();
        assert!(matches!(err, BackendError::Destination { .. }));

        let out = tempdir().unwrap();
        let err = backend.download("b", out.path(), None).unwrap_err();
        assert!(matches!(err, BackendError::NotFound(name) if name == "b"));
    }

    #[test]
    fn names_escaping_the_prefix_are_rejected() {
        let storage = tempdir().unwrap();
        fs::write(storage.path().join("secret"), b"s").unwrap();
        let backend = validated(storage.path(), Some("site1"));
        let out = tempdir().unwrap();

        let err = backend.download("../secret", out.path(), Some("x")).unwrap_err();
        assert!(matches!(err, BackendError::Security(_)));
        assert!(matches!(backend.delete("../secret"), Err(BackendError::Security(_))));
        assert!(storage.path().join("secret").exists());

        let err = backend.download("ok", out.path(), Some("../x")).unwrap_err();
        assert!(matches!(err, BackendError::Security(_)));
    }

    #[test]
    fn prefix_escaping_the_root_is_rejected() {
        let err = Local::new("/srv/backup", Some("../etc")).unwrap_err();
        assert_eq!(err.name, "../etc");

        let config: Table = toml::from_str("path = '/srv/backup'\nprefix = '/abs'").unwrap();
        assert!(matches!(
            Local::from_config(&config),
            Err(ConfigError::Security(_))
        ));
    }

    #[test]
    fn from_config_rejects_malformed_tables() {
        let config: Table = toml::from_str("prefix = 'x'").unwrap();
        assert!(matches!(
            Local::from_config(&config),
            Err(ConfigError::InvalidBackend { kind, .. }) if kind == KIND
        ));

        let config: Table = toml::from_str("path = '/x'\nbucket = 'y'").unwrap();
        assert!(Local::from_config(&config).is_err());
    }
}
