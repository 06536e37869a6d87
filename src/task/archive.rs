//! Packaging of task sources into timestamped `.tar.gz` archives.
//!
//! Every source is stored under its file name at the top level of the
//! archive, so extracting it next to the original location restores it.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDateTime};
use derive_more::{Display, Error};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M";

/// File extension of the archives.
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

static ARCHIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<backup>.+)-(?P<timestamp>\d{4}-\d{2}-\d{2}-\d{2}-\d{2})\.tar\.gz$")
        .expect("archive name pattern should compile")
});

#[derive(Debug, Display, Error)]
/// Errors while building an archive.
pub enum PackagingError {
    /// A source disappeared after validation.
    #[display("The source {} vanished before packaging", _0.display())]
    SourceVanished(#[error(ignore)] PathBuf),
    /// A source has no file name to store it under.
    #[display("The source {} has no file name", _0.display())]
    UnnamedSource(#[error(ignore)] PathBuf),
    /// An archive of that name already exists.
    #[display("The archive {_0} already exists")]
    Collision(#[error(ignore)] String),
    /// Writing the archive failed.
    #[display("Can't write the archive {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// Name of the archive of `backup_name` created at `timestamp`.
pub fn archive_name(backup_name: &str, timestamp: DateTime<Local>) -> String {
    let timestamp = timestamp.format(TIMESTAMP_FORMAT);
    format!("{backup_name}-{timestamp}.{ARCHIVE_EXTENSION}")
}

/// An archive name split into backup name and creation time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ArchiveName {
    pub backup_name: String,
    pub created: NaiveDateTime,
}

impl ArchiveName {
    /// Parses names produced by [archive_name].
    pub fn parse(name: &str) -> Option<Self> {
        let captures = ARCHIVE_NAME.captures(name)?;
        let created =
            NaiveDateTime::parse_from_str(&captures["timestamp"], TIMESTAMP_FORMAT).ok()?;

        Some(Self {
            backup_name: captures["backup"].to_string(),
            created,
        })
    }
}

/// Name a source is stored under in the archive.
pub fn entry_name(source: &Path) -> Option<&OsStr> {
    source.file_name()
}

/// Writes a gzip compressed tar of all `sources` to the new file `archive`.
pub fn pack(sources: &[PathBuf], archive: &Path) -> Result<(), PackagingError> {
    let write_error = |source: io::Error| PackagingError::Write {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::create_new(archive).map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => PackagingError::Collision(archive.display().to_string()),
        _ => write_error(e),
    })?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for source in sources {
        let name =
            entry_name(source).ok_or_else(|| PackagingError::UnnamedSource(source.clone()))?;
        let metadata = fs::symlink_metadata(source).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PackagingError::SourceVanished(source.clone()),
            _ => write_error(e),
        })?;

        log::trace!(target: "task::archive", "Adding {} to {}", source.display(), archive.display());
        let appended = if metadata.is_dir() {
            builder.append_dir_all(name, source)
        } else {
            builder.append_path_with_name(source, name)
        };
        appended.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PackagingError::SourceVanished(source.clone()),
            _ => write_error(e),
        })?;
    }

    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .map_err(write_error)?;

    Ok(())
}

/// Extracts `archive` into the existing directory `dst`.
pub fn unpack(archive: &Path, dst: &Path) -> io::Result<()> {
    let file = File::open(archive)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_mtime(true);
    archive.unpack(dst)
}

/// Replaces whatever is at `target` by `staged`.
pub fn replace_with(staged: &Path, target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(target)?,
        Ok(_) => fs::remove_file(target)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    // rename fails across filesystems
    if fs::rename(staged, target).is_err() {
        copy_recursively(staged, target)?;
    }
    Ok(())
}

fn copy_recursively(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::symlink_metadata(src)?.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}
