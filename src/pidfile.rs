//! PID file handling: the daemon's only persisted state.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A written PID file, removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current PID (one decimal line) to `path`.
    ///
    /// A stale file from a previous run is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be written;
    /// treated as a startup configuration failure.
    pub fn create(path: &Path) -> Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id())).map_err(|e| Error::Config {
            section: "arcd".to_string(),
            key: "pid_file".to_string(),
            reason: format!("cannot write {}: {e}", path.display()),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// The file's location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arcxd.pid");

        let pidfile = PidFile::create(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("{}\n", std::process::id()));

        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_file_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arcxd.pid");
        std::fs::write(&path, "99999\n").unwrap();

        let _pidfile = PidFile::create(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn test_unwritable_path_fails() {
        let path = Path::new("/nonexistent-dir/arcxd.pid");
        assert!(PidFile::create(path).is_err());
    }
}
