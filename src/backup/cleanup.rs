use crate::error::{BackupError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Default)]
struct TrackedFiles {
    paths: Vec<PathBuf>,
    preserved: bool,
}

/// Files and scratch directories created by the current run. Shared with
/// the termination handler so an interrupted run removes the same files a
/// failed one would.
#[derive(Clone, Default)]
pub struct CleanupTracker {
    inner: Arc<Mutex<TrackedFiles>>,
}

impl CleanupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackedFiles> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn track(&self, path: &Path) {
        let mut state = self.state();
        if !state.paths.iter().any(|p| p == path) {
            state.paths.push(path.to_path_buf());
        }
    }

    /// Keeps the tracked files from now on. Set once a durable copy exists,
    /// or when the local artifact is the only copy left.
    pub fn preserve(&self) {
        self.state().preserved = true;
    }

    pub fn is_preserved(&self) -> bool {
        self.state().preserved
    }

    /// Removes every tracked path that still exists, unless preserved.
    /// Safe to call more than once. Returns how many paths were removed.
    pub fn cleanup(&self) -> usize {
        let mut state = self.state();
        if state.preserved {
            debug!("Artifacts preserved; skipping cleanup");
            return 0;
        }
        let mut removed = 0;
        for path in state.paths.drain(..) {
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else if path.exists() {
                fs::remove_file(&path)
            } else {
                continue;
            };
            match result {
                Ok(()) => {
                    info!("Removed {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        }
        removed
    }
}

/// Lock file that keeps two runs for the same database from overlapping.
/// Released on drop.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dir: &Path, database: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(".{}.lock", database));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => BackupError::AlreadyRunning(format!(
                    "lock file {} exists; another run for '{}' is in progress or crashed",
                    path.display(),
                    database
                )),
                _ => BackupError::Io(e),
            })?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cleanup_removes_files_and_dirs_once() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.backup");
        let scratch = dir.path().join("a.backup.partial.d");
        fs::write(&file, b"x").unwrap();
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("toc.dat"), b"x").unwrap();

        let tracker = CleanupTracker::new();
        tracker.track(&file);
        tracker.track(&file);
        tracker.track(&scratch);
        tracker.track(&dir.path().join("never-created"));

        assert_eq!(tracker.cleanup(), 2);
        assert!(!file.exists());
        assert!(!scratch.exists());
        assert_eq!(tracker.cleanup(), 0);
    }

    #[test]
    fn test_preserved_files_survive_cleanup() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.backup");
        fs::write(&file, b"x").unwrap();

        let tracker = CleanupTracker::new();
        tracker.track(&file);
        tracker.clone().preserve();

        assert!(tracker.is_preserved());
        assert_eq!(tracker.cleanup(), 0);
        assert!(file.exists());
    }

    #[test]
    fn test_run_lock_is_exclusive_and_released() {
        let dir = tempdir().unwrap();
        let lock = RunLock::acquire(dir.path(), "appdb").unwrap();
        assert!(lock.path().exists());
        assert!(matches!(
            RunLock::acquire(dir.path(), "appdb"),
            Err(BackupError::AlreadyRunning(_))
        ));
        let other = RunLock::acquire(dir.path(), "otherdb");
        assert!(other.is_ok());

        drop(lock);
        assert!(RunLock::acquire(dir.path(), "appdb").is_ok());
    }
}
