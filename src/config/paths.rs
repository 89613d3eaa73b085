//! Path resolution for medsync configuration and data files.
//!
//! All medsync data is stored in `~/.medsync/` unless `MEDSYNC_HOME` is set:
//! - `config.yaml` - Main configuration file
//! - `medsync.db` - SQLite database for the queue, delta state and history
//!
//! Logs go to stderr; nothing is written under the root besides these.

use std::path::PathBuf;

use crate::error::SyncError;

/// Paths to medsync configuration and data directories.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root directory: `~/.medsync/`
    pub root: PathBuf,
    /// Config file: `~/.medsync/config.yaml`
    pub config_file: PathBuf,
    /// Database file: `~/.medsync/medsync.db`
    pub database: PathBuf,
}

impl Paths {
    /// Create paths based on `MEDSYNC_HOME` or the user's home directory.
    ///
    /// # Errors
    ///
    /// Returns an error if neither variable is set.
    pub fn new() -> Result<Self, SyncError> {
        if let Ok(root) = std::env::var("MEDSYNC_HOME") {
            return Ok(Self::with_root(PathBuf::from(root)));
        }

        let home = std::env::var("HOME").map_err(|_| {
            SyncError::Config("Could not determine home directory".to_string())
        })?;

        Ok(Self::with_root(PathBuf::from(home).join(".medsync")))
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            config_file: root.join("config.yaml"),
            database: root.join("medsync.db"),
            root,
        }
    }

    /// Ensure the root directory exists, creating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn ensure_dirs(&self) -> Result<(), SyncError> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).map_err(|e| {
                SyncError::Config(format!(
                    "Failed to create directory {}: {e}",
                    self.root.display()
                ))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_with_root() {
        let root = PathBuf::from("/tmp/test-medsync");
        let paths = Paths::with_root(root.clone());

        assert_eq!(paths.root, root);
        assert_eq!(paths.config_file, root.join("config.yaml"));
        assert_eq!(paths.database, root.join("medsync.db"));
    }

    #[test]
    fn test_ensure_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let paths = Paths::with_root(temp_dir.path().join("nested"));

        paths.ensure_dirs().unwrap();

        assert!(paths.root.exists());
        let entries: Vec<_> = std::fs::read_dir(&paths.root).unwrap().collect();
        assert!(entries.is_empty());
    }
}
