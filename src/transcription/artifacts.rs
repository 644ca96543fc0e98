//! # Job Artifacts
//!
//! Every file a job creates or is handed (uploaded audio, converted audio,
//! engine output) is registered in the job's [`ArtifactSet`]. The set is
//! emptied by [`ArtifactSet::cleanup`] at the end of the job, and again by
//! `Drop` if the job future is abandoned before reaching cleanup.
//!
//! ## Cleanup Semantics:
//! - Best-effort: a file that is already gone counts as removed
//! - Other failures are reported as warnings and never surface as job errors
//! - Idempotent: paths are forgotten once attempted, so a second call is a no-op

use std::io;
use std::path::{Path, PathBuf};

/// A failed deletion, reported for logging only.
#[derive(Debug)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub error: io::Error,
}

/// Summary of one cleanup pass.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Files that existed and were deleted
    pub removed: usize,
    /// Files that were already absent
    pub missing: usize,
    pub warnings: Vec<CleanupWarning>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn log_warnings(&self) {
        for warning in &self.warnings {
            tracing::warn!(
                path = %warning.path.display(),
                error = %warning.error,
                "Failed to delete job artifact"
            );
        }
    }
}

/// Paths owned by a single job.
#[derive(Debug, Default)]
pub struct ArtifactSet {
    paths: Vec<PathBuf>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path for deletion when the job ends.
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Delete every tracked path.
    pub fn cleanup(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();

        for path in self.paths.drain(..) {
            match remove(&path) {
                Ok(true) => report.removed += 1,
                Ok(false) => report.missing += 1,
                Err(error) => report.warnings.push(CleanupWarning { path, error }),
            }
        }

        report
    }
}

impl Drop for ArtifactSet {
    fn drop(&mut self) {
        if !self.is_empty() {
            tracing::debug!(count = self.paths.len(), "Removing artifacts of abandoned job");
            self.cleanup().log_warnings();
        }
    }
}

/// `Ok(true)` if deleted, `Ok(false)` if there was nothing to delete.
fn remove(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn test_cleanup_removes_all_tracked_files() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.oga");
        let b = touch(&dir, "a.txt");

        let mut set = ArtifactSet::new();
        set.track(&a);
        set.track(&b);
        set.track(&a);
        assert!(!set.is_empty());

        let report = set.cleanup();
        assert_eq!(report.removed, 2);
        assert!(report.is_clean());
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn test_cleanup_twice_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut set = ArtifactSet::new();
        set.track(touch(&dir, "a.oga"));

        assert_eq!(set.cleanup().removed, 1);
        let second = set.cleanup();
        assert_eq!(second.removed, 0);
        assert_eq!(second.missing, 0);
        assert!(second.is_clean());
    }

    #[test]
    fn test_missing_files_are_not_errors() {
        let dir = TempDir::new().unwrap();
        let mut set = ArtifactSet::new();
        set.track(dir.path().join("never-created.json"));

        let report = set.cleanup();
        assert_eq!(report.missing, 1);
        assert!(report.is_clean());
    }

    #[test]
    fn test_failed_deletion_does_not_stop_the_rest() {
        let dir = TempDir::new().unwrap();
        // remove_file on a directory fails
        let stubborn = dir.path().join("stubborn");
        std::fs::create_dir(&stubborn).unwrap();
        let a = touch(&dir, "a.oga");
        let b = touch(&dir, "a.wav");

        let mut set = ArtifactSet::new();
        set.track(&a);
        set.track(&stubborn);
        set.track(&b);

        let report = set.cleanup();
        assert_eq!(report.removed, 2);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].path, stubborn);
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn test_drop_cleans_up() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.oga");
        {
            let mut set = ArtifactSet::new();
            set.track(&a);
        }
        assert!(!a.exists());
    }
}
