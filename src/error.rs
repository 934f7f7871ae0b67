//! Tagged error sum for all fallible Barn operations.
//!
//! Every public operation returns `Result<T, BarnError>`. Kinds mirror the
//! internal taxonomy: each carries enough context (job id, path) to log or
//! surface to a caller without re-deriving it from a generic string.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BarnError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidStateTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("lock contended: {0}")]
    LockContended(String),

    #[error("io error at {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("corrupted state: {0}")]
    Corrupted(String),
}

impl BarnError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BarnError::IoError {
            path: path.into(),
            source,
        }
    }

    /// True for errors that are safe to treat as "absent" when reading
    /// best-effort state (corrupted single-value files, missing directories).
    pub fn is_benign_absence(&self) -> bool {
        matches!(self, BarnError::NotFound(_) | BarnError::Corrupted(_))
    }
}

pub type BarnResult<T> = Result<T, BarnError>;

/// Extension used at `std::fs` call sites to attach path context, mirroring
/// the `.with_context(...)` idiom but producing a typed variant.
pub trait IoContext<T> {
    fn io_ctx(self, path: impl Into<PathBuf>) -> BarnResult<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_ctx(self, path: impl Into<PathBuf>) -> BarnResult<T> {
        self.map_err(|e| BarnError::io(path, e))
    }
}
