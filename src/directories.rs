//! Resolves canonical paths under a base directory and creates the on-disk
//! layout at startup. Path joins for job content always go through here so
//! that job ids (validated elsewhere) cannot escape the jobs directory.

use std::path::{Path, PathBuf};

use crate::error::{BarnResult, IoContext};

/// Resolve the base directory: explicit override, then `BARN_HOME` env var,
/// then the platform data directory (`directories::BaseDirs`), matching the
/// priority chain the teacher uses for its own job root.
pub fn resolve_base_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(p) = std::env::var("BARN_HOME") {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    if let Some(base_dirs) = directories::BaseDirs::new() {
        return base_dirs.data_local_dir().join("barn");
    }
    PathBuf::from(".barn")
}

/// Resolve the system config directory that holds load-level whitelist
/// files, honoring `BARN_CONFIG_DIR` before falling back to the platform
/// convention (`/etc/barn` on Unix).
pub fn resolve_config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("BARN_CONFIG_DIR") {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    #[cfg(unix)]
    {
        PathBuf::from("/etc/barn")
    }
    #[cfg(windows)]
    {
        if let Some(proj) = directories::ProjectDirs::from("", "", "barn") {
            return proj.config_dir().to_path_buf();
        }
        PathBuf::from("C:/ProgramData/barn")
    }
}

/// A job id must match `^[a-z0-9-]+$`; this is enforced everywhere a job id
/// is turned into a path component to prevent traversal.
pub fn validate_job_id(id: &str) -> BarnResult<()> {
    let valid = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(crate::error::BarnError::InvalidArgument(format!(
            "invalid job id: {id:?}"
        )))
    }
}

#[derive(Debug, Clone)]
pub struct BarnDirectories {
    base: PathBuf,
}

impl BarnDirectories {
    pub fn new(base: PathBuf) -> Self {
        BarnDirectories { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.base.join("jobs")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.base.join("locks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn barn_log_path(&self) -> PathBuf {
        self.logs_dir().join("barn.log")
    }

    pub fn barn_pid_path(&self) -> PathBuf {
        self.base.join("barn.pid")
    }

    pub fn barn_sock_path(&self) -> PathBuf {
        self.base.join("barn.sock")
    }

    pub fn scheduler_lock_path(&self) -> PathBuf {
        self.locks_dir().join("scheduler.lock")
    }

    pub fn job_lock_path(&self, job_id: &str) -> PathBuf {
        self.locks_dir().join(format!("job-{job_id}.lock"))
    }

    /// Path to a job's own directory. Validates `job_id` first so a
    /// malformed id can never be joined onto a filesystem path.
    pub fn job_dir(&self, job_id: &str) -> BarnResult<PathBuf> {
        validate_job_id(job_id)?;
        Ok(self.jobs_dir().join(job_id))
    }

    pub fn job_work_dir(&self, job_id: &str) -> BarnResult<PathBuf> {
        Ok(self.job_dir(job_id)?.join("work"))
    }

    pub fn job_work_input_dir(&self, job_id: &str) -> BarnResult<PathBuf> {
        Ok(self.job_work_dir(job_id)?.join("input"))
    }

    pub fn job_work_output_dir(&self, job_id: &str) -> BarnResult<PathBuf> {
        Ok(self.job_work_dir(job_id)?.join("output"))
    }

    pub fn job_logs_dir(&self, job_id: &str) -> BarnResult<PathBuf> {
        Ok(self.job_dir(job_id)?.join("logs"))
    }

    pub fn job_stdout_log(&self, job_id: &str) -> BarnResult<PathBuf> {
        Ok(self.job_logs_dir(job_id)?.join("stdout.log"))
    }

    pub fn job_stderr_log(&self, job_id: &str) -> BarnResult<PathBuf> {
        Ok(self.job_logs_dir(job_id)?.join("stderr.log"))
    }

    pub fn job_progress_log(&self, job_id: &str) -> BarnResult<PathBuf> {
        Ok(self.job_logs_dir(job_id)?.join("progress.log"))
    }

    pub fn job_usage_csv(&self, job_id: &str) -> BarnResult<PathBuf> {
        Ok(self.job_logs_dir(job_id)?.join("usage.csv"))
    }

    pub fn job_manifest_path(&self, job_id: &str) -> BarnResult<PathBuf> {
        Ok(self.job_dir(job_id)?.join("manifest.json"))
    }

    pub fn job_field_path(&self, job_id: &str, field: &str) -> BarnResult<PathBuf> {
        Ok(self.job_dir(job_id)?.join(field))
    }

    /// Create the top-level layout (`jobs/`, `locks/`, `logs/`). Per-job
    /// subdirectories are created by `JobRepository::create`.
    pub fn init_layout(&self) -> BarnResult<()> {
        for dir in [self.jobs_dir(), self.locks_dir(), self.logs_dir()] {
            std::fs::create_dir_all(&dir).io_ctx(&dir)?;
        }
        Ok(())
    }

    /// Create a fresh job directory's full subtree (`work/{input,output}`,
    /// `logs/`).
    pub fn init_job_layout(&self, job_id: &str) -> BarnResult<()> {
        for dir in [
            self.job_work_input_dir(job_id)?,
            self.job_work_output_dir(job_id)?,
            self.job_logs_dir(job_id)?,
        ] {
            std::fs::create_dir_all(&dir).io_ctx(&dir)?;
        }
        Ok(())
    }
}
