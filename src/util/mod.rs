//! Small helpers shared by the tasks and the command line.

pub mod retention;

use std::io;
use std::path::Path;

/// Fails unless the current user can create files in `dir`.
///
/// Permission bits alone don't tell, so an anonymous temporary file is
/// created and dropped.
pub fn ensure_writable(dir: &Path) -> io::Result<()> {
    tempfile::tempfile_in(dir).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::tempdir;

    #[test]
    fn ensure_writable_creates_no_leftovers() {
        let dir = tempdir().unwrap();
        ensure_writable(dir.path()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn ensure_writable_fails_outside_directories() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, "").unwrap();

        assert!(ensure_writable(&file).is_err());
        assert!(ensure_writable(&dir.path().join("missing")).is_err());
    }
}
