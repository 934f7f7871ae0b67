//! Advisory OS file locks: `SchedulerLock` (single-daemon) and per-job locks
//! (single-writer per job). Both are scope-bound guards that release on
//! every exit path, including unwinding, matching the `try-with-resources`
//! idiom spec §9 calls out.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{BarnError, BarnResult, IoContext};

/// A held advisory lock. Unlocked on drop.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    fn try_acquire(path: &Path) -> BarnResult<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).io_ctx(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .io_ctx(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockGuard {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(BarnError::io(path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Cross-process advisory lock preventing multiple schedulers. Held for the
/// daemon's entire run.
pub struct SchedulerLock {
    guard: LockGuard,
}

impl SchedulerLock {
    /// Returns `None` if another process already holds the lock, rather
    /// than blocking — the daemon must abort startup on contention, per
    /// spec §7's "aborts only on failure to acquire the scheduler lock".
    pub fn try_acquire(path: &Path) -> BarnResult<Option<Self>> {
        Ok(LockGuard::try_acquire(path)?.map(|guard| SchedulerLock { guard }))
    }

    pub fn path(&self) -> &Path {
        self.guard.path()
    }
}

/// Per-job advisory lock, held by whichever worker owns a job's RUNNING
/// lifetime, and transiently by Cleanup when deleting.
pub struct JobLock {
    guard: LockGuard,
}

impl JobLock {
    pub fn try_acquire(path: &Path) -> BarnResult<Option<Self>> {
        Ok(LockGuard::try_acquire(path)?.map(|guard| JobLock { guard }))
    }

    pub fn path(&self) -> &Path {
        self.guard.path()
    }
}
