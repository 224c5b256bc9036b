use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, warn};

static GLOBAL: OnceLock<Arc<CleanupTracker>> = OnceLock::new();

/// Records every session directory ever created so that anything not
/// released by an explicit cleanup is removed when the process exits.
#[derive(Debug, Default)]
pub struct CleanupTracker {
    paths: Mutex<BTreeSet<PathBuf>>,
}

impl CleanupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide tracker. The first call registers an exit hook that
    /// runs [`CleanupTracker::cleanup_all`].
    pub fn global() -> Arc<CleanupTracker> {
        GLOBAL
            .get_or_init(|| {
                let rc = unsafe { libc::atexit(cleanup_global_at_exit) };
                if rc != 0 {
                    warn!("failed to register exit cleanup hook");
                }
                Arc::new(CleanupTracker::new())
            })
            .clone()
    }

    pub fn track(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        debug!(path = %path.display(), "tracking sandbox directory");
        self.lock().insert(path);
    }

    /// Forget a path that its owner has already removed.
    pub fn release(&self, path: &Path) -> bool {
        self.lock().remove(path)
    }

    pub fn tracked(&self) -> Vec<PathBuf> {
        self.lock().iter().cloned().collect()
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    /// Removes every tracked path. Safe to call more than once; returns how
    /// many paths were actually deleted.
    pub fn cleanup_all(&self) -> usize {
        let paths: Vec<PathBuf> = std::mem::take(&mut *self.lock()).into_iter().collect();
        let mut removed = 0;
        for path in paths {
            match remove_path(&path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove sandbox directory"),
            }
        }
        removed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

extern "C" fn cleanup_global_at_exit() {
    if let Some(tracker) = GLOBAL.get() {
        tracker.cleanup_all();
    }
}

/// Removes a file or directory tree. Refuses relative paths and `/`, and
/// treats an already-missing path as success.
pub(crate) fn remove_path(path: &Path) -> io::Result<bool> {
    if !path.is_absolute() || path == Path::new("/") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to remove {}", path.display()),
        ));
    }
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_all_removes_tracked_directories_once() {
        let root = tempfile::tempdir().expect("tempdir");
        let tracker = CleanupTracker::new();
        let a = root.path().join("a");
        let b = root.path().join("b");
        fs::create_dir_all(a.join("nested")).expect("mkdir");
        fs::write(a.join("nested/file.txt"), "x").expect("write");
        fs::create_dir_all(&b).expect("mkdir");
        tracker.track(&a);
        tracker.track(&b);

        assert_eq!(tracker.cleanup_all(), 2);
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(tracker.tracked().is_empty());
        assert_eq!(tracker.cleanup_all(), 0);
    }

    #[test]
    fn released_paths_are_left_alone() {
        let root = tempfile::tempdir().expect("tempdir");
        let tracker = CleanupTracker::new();
        let kept = root.path().join("kept");
        fs::create_dir_all(&kept).expect("mkdir");
        tracker.track(&kept);
        assert!(tracker.release(&kept));
        assert!(!tracker.release(&kept));
        tracker.cleanup_all();
        assert!(kept.exists());
    }

    #[test]
    fn remove_path_refuses_dangerous_targets() {
        assert!(remove_path(Path::new("/")).is_err());
        assert!(remove_path(Path::new("relative/dir")).is_err());
        assert!(!remove_path(Path::new("/nonexistent/pysandbox/path")).expect("missing ok"));
    }

    #[test]
    fn global_tracker_is_shared() {
        let a = CleanupTracker::global();
        let b = CleanupTracker::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
