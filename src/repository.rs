//! CRUD over per-job directories: enumeration and state transitions with
//! invariants (spec §4.2). All writes to a given job must be serialized by
//! the caller holding that job's per-job lock; reads never block and may
//! observe an older atomic snapshot.

use std::sync::Arc;

use crate::clock::Clock;
use crate::directories::BarnDirectories;
use crate::error::{BarnError, BarnResult, IoContext};
use crate::job::{Job, JobState, LoadLevel, RetryHistoryEntry};
use crate::manifest::Manifest;
use crate::state_io;

const HEX_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

pub struct JobRepository {
    dirs: BarnDirectories,
    clock: Arc<dyn Clock>,
}

impl JobRepository {
    pub fn new(dirs: BarnDirectories, clock: Arc<dyn Clock>) -> Self {
        JobRepository { dirs, clock }
    }

    pub fn directories(&self) -> &BarnDirectories {
        &self.dirs
    }

    fn generate_id(&self) -> String {
        format!("job-{}", nanoid::nanoid!(8, &HEX_ALPHABET))
    }

    /// Generates an id, retrying on collision (vanishingly rare with 8 hex
    /// chars, but the directory-already-exists check makes it free to be
    /// safe about it).
    pub fn create(
        &self,
        command: Vec<String>,
        tag: Option<String>,
        load_level: LoadLevel,
        manifest_overrides: impl FnOnce(&mut Manifest),
    ) -> BarnResult<Job> {
        if command.is_empty() {
            return Err(BarnError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        let mut manifest = Manifest::new(command, tag.clone(), load_level)?;
        manifest_overrides(&mut manifest);

        let id = loop {
            let candidate = self.generate_id();
            let dir = self.dirs.job_dir(&candidate)?;
            if !dir.exists() {
                break candidate;
            }
        };

        self.dirs.init_job_layout(&id)?;
        manifest.write(&self.dirs.job_manifest_path(&id)?)?;

        let now = self.clock.now_rfc3339();
        state_io::write_atomic(&self.dirs.job_field_path(&id, "state")?, JobState::Queued.as_str())?;
        state_io::write_atomic(&self.dirs.job_field_path(&id, "load_level")?, load_level.as_str())?;
        state_io::write_atomic(&self.dirs.job_field_path(&id, "created_at")?, &now)?;
        state_io::write_atomic(&self.dirs.job_field_path(&id, "retry_count")?, "0")?;
        if let Some(tag) = &tag {
            state_io::write_atomic(&self.dirs.job_field_path(&id, "tag")?, tag)?;
        }

        self.find_by_id(&id)?
            .ok_or_else(|| BarnError::NotFound(id.clone()))
    }

    /// Lists subdirectories of `jobs/`; silently skips entries missing the
    /// minimum invariant files (manifest, state, load_level, created_at).
    pub fn find_all(&self) -> BarnResult<Vec<Job>> {
        let jobs_dir = self.dirs.jobs_dir();
        let entries = match std::fs::read_dir(&jobs_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BarnError::io(&jobs_dir, e)),
        };

        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry.io_ctx(&jobs_dir)?;
            if !entry.file_type().io_ctx(&jobs_dir)?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.find_by_id(&name) {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) if e.is_benign_absence() => {}
                Err(e) => {
                    tracing::warn!(job_id = %name, error = %e, "skipping unreadable job directory");
                }
            }
        }
        Ok(jobs)
    }

    pub fn find_by_id(&self, id: &str) -> BarnResult<Option<Job>> {
        let dir = self.dirs.job_dir(id)?;
        if !dir.exists() {
            return Ok(None);
        }

        let state_str = match state_io::read_optional(&self.dirs.job_field_path(id, "state")?)? {
            Some(s) => s,
            None => return Ok(None),
        };
        let load_level_str =
            match state_io::read_optional(&self.dirs.job_field_path(id, "load_level")?)? {
                Some(s) => s,
                None => return Ok(None),
            };
        let created_at = match state_io::read_optional(&self.dirs.job_field_path(id, "created_at")?)? {
            Some(s) => s,
            None => return Ok(None),
        };
        if !self.dirs.job_manifest_path(id)?.exists() {
            return Ok(None);
        }

        let state = match JobState::parse(&state_str) {
            Ok(s) => s,
            Err(_) => return Ok(None),
        };
        let load_level = match LoadLevel::parse(&load_level_str) {
            Ok(l) => l,
            Err(_) => return Ok(None),
        };

        let tag = state_io::read_optional(&self.dirs.job_field_path(id, "tag")?)?;
        let started_at = state_io::read_optional(&self.dirs.job_field_path(id, "started_at")?)?;
        let finished_at = state_io::read_optional(&self.dirs.job_field_path(id, "finished_at")?)?;
        let heartbeat = state_io::read_optional(&self.dirs.job_field_path(id, "heartbeat")?)?;
        let pid = state_io::read_optional(&self.dirs.job_field_path(id, "pid")?)?
            .and_then(|s| s.parse().ok());
        let exit_code = state_io::read_optional(&self.dirs.job_field_path(id, "exit_code")?)?;
        let error = state_io::read_optional(&self.dirs.job_field_path(id, "error")?)?;
        let retry_count = state_io::read_optional(&self.dirs.job_field_path(id, "retry_count")?)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let retry_at = state_io::read_optional(&self.dirs.job_field_path(id, "retry_at")?)?;
        let retry_history = self.read_retry_history(id)?;

        Ok(Some(Job {
            id: id.to_string(),
            state,
            load_level,
            tag,
            created_at,
            started_at,
            finished_at,
            heartbeat,
            pid,
            exit_code,
            error,
            retry_count,
            retry_at,
            retry_history,
        }))
    }

    pub fn find_by_state(&self, state: JobState) -> BarnResult<Vec<Job>> {
        Ok(self
            .find_all()?
            .into_iter()
            .filter(|j| j.state == state)
            .collect())
    }

    fn read_retry_history(&self, id: &str) -> BarnResult<Vec<RetryHistoryEntry>> {
        let path = self.dirs.job_field_path(id, "retry_history")?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(contents
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(BarnError::io(&path, e)),
        }
    }

    pub fn load_manifest(&self, id: &str) -> BarnResult<Manifest> {
        Manifest::read(&self.dirs.job_manifest_path(id)?)
    }

    /// Generic transition enforcing the state machine; callers that need a
    /// specific side-effecting transition should prefer the `mark_*`
    /// helpers, which also write the associated timestamp/result fields.
    pub fn update_state(&self, id: &str, new_state: JobState) -> BarnResult<()> {
        self.update_state_inner(id, new_state, false)
    }

    fn update_state_inner(&self, id: &str, new_state: JobState, via_retry: bool) -> BarnResult<()> {
        let current = self
            .find_by_id(id)?
            .ok_or_else(|| BarnError::NotFound(id.to_string()))?;
        if !current.state.validate_transition(new_state, via_retry) {
            return Err(BarnError::InvalidStateTransition {
                job_id: id.to_string(),
                from: current.state.as_str().to_string(),
                to: new_state.as_str().to_string(),
            });
        }
        state_io::write_atomic(&self.dirs.job_field_path(id, "state")?, new_state.as_str())
    }

    pub fn mark_started(&self, id: &str, pid: u32) -> BarnResult<()> {
        self.update_state_inner(id, JobState::Running, false)?;
        let now = self.clock.now_rfc3339();
        state_io::write_atomic(&self.dirs.job_field_path(id, "started_at")?, &now)?;
        state_io::write_atomic(&self.dirs.job_field_path(id, "pid")?, &pid.to_string())?;
        state_io::write_atomic(&self.dirs.job_field_path(id, "heartbeat")?, &now)?;
        Ok(())
    }

    /// SUCCEEDED iff `exit_code == Some(0)` and `error` is `None`, else
    /// FAILED (spec §4.2).
    pub fn mark_completed(
        &self,
        id: &str,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> BarnResult<()> {
        let succeeded = exit_code == Some(0) && error.is_none();
        let target = if succeeded {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        self.update_state_inner(id, target, false)?;
        let now = self.clock.now_rfc3339();
        state_io::write_atomic(&self.dirs.job_field_path(id, "finished_at")?, &now)?;
        if let Some(code) = exit_code {
            state_io::write_atomic(&self.dirs.job_field_path(id, "exit_code")?, &code.to_string())?;
        }
        if let Some(err) = &error {
            state_io::write_atomic(&self.dirs.job_field_path(id, "error")?, err)?;
        }
        Ok(())
    }

    pub fn mark_canceled(&self, id: &str) -> BarnResult<()> {
        self.update_state_inner(id, JobState::Canceled, false)?;
        let now = self.clock.now_rfc3339();
        state_io::write_atomic(&self.dirs.job_field_path(id, "finished_at")?, &now)
    }

    pub fn mark_killed(&self, id: &str, exit_code: Option<i32>) -> BarnResult<()> {
        self.update_state_inner(id, JobState::Killed, false)?;
        let now = self.clock.now_rfc3339();
        state_io::write_atomic(&self.dirs.job_field_path(id, "finished_at")?, &now)?;
        if let Some(code) = exit_code {
            state_io::write_atomic(&self.dirs.job_field_path(id, "exit_code")?, &code.to_string())?;
        }
        Ok(())
    }

    /// No-op if the job is not RUNNING (spec §4.2); heartbeat write failures
    /// are the caller's concern to log as a warning, not an error here.
    pub fn update_heartbeat(&self, id: &str) -> BarnResult<()> {
        let Some(job) = self.find_by_id(id)? else {
            return Ok(());
        };
        if job.state != JobState::Running {
            return Ok(());
        }
        state_io::write_atomic(
            &self.dirs.job_field_path(id, "heartbeat")?,
            &self.clock.now_rfc3339(),
        )
    }

    /// Appends to `retry_history`, increments `retry_count`, sets
    /// `retry_at`, and resets the job back to QUEUED, clearing
    /// started_at/finished_at/exit_code/error/pid (spec §4.2).
    pub fn increment_retry(
        &self,
        id: &str,
        last_exit_code: Option<i32>,
        last_error: Option<String>,
        next_retry_at: &str,
    ) -> BarnResult<()> {
        let job = self
            .find_by_id(id)?
            .ok_or_else(|| BarnError::NotFound(id.to_string()))?;

        let entry = RetryHistoryEntry {
            attempt: job.retry_count + 1,
            exit_code: last_exit_code,
            error: last_error,
        };
        let line = serde_json::to_string(&entry)
            .map_err(|e| BarnError::Corrupted(format!("failed to serialize retry entry: {e}")))?;
        state_io::append_line(&self.dirs.job_field_path(id, "retry_history")?, &line)?;

        state_io::write_atomic(
            &self.dirs.job_field_path(id, "retry_count")?,
            &(job.retry_count + 1).to_string(),
        )?;
        state_io::write_atomic(&self.dirs.job_field_path(id, "retry_at")?, next_retry_at)?;

        self.update_state_inner(id, JobState::Queued, true)?;

        for field in ["started_at", "finished_at", "exit_code", "error", "pid"] {
            let path = self.dirs.job_field_path(id, field)?;
            let _ = std::fs::remove_file(&path);
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> BarnResult<()> {
        let dir = self.dirs.job_dir(id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BarnError::io(&dir, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use tempfile::tempdir;

    fn repo_in(base: std::path::PathBuf) -> JobRepository {
        let dirs = BarnDirectories::new(base);
        dirs.init_layout().unwrap();
        JobRepository::new(dirs, Arc::new(SystemClock))
    }

    #[test]
    fn create_rejects_empty_command() {
        let dir = tempdir().unwrap();
        let repo = repo_in(dir.path().to_path_buf());
        let err = repo
            .create(vec![], None, LoadLevel::Medium, |_| {})
            .unwrap_err();
        assert!(matches!(err, BarnError::InvalidArgument(_)));
    }

    #[test]
    fn create_then_find_by_id_round_trips() {
        let dir = tempdir().unwrap();
        let repo = repo_in(dir.path().to_path_buf());
        let job = repo
            .create(
                vec!["echo".into(), "hi".into()],
                Some("demo".into()),
                LoadLevel::High,
                |_| {},
            )
            .unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.load_level, LoadLevel::High);
        assert_eq!(job.retry_count, 0);

        let found = repo.find_by_id(&job.id).unwrap().unwrap();
        assert_eq!(found.id, job.id);
        assert_eq!(found.tag.as_deref(), Some("demo"));
    }

    #[test]
    fn full_happy_path_lifecycle() {
        let dir = tempdir().unwrap();
        let repo = repo_in(dir.path().to_path_buf());
        let job = repo
            .create(vec!["echo".into()], None, LoadLevel::Medium, |_| {})
            .unwrap();
        repo.mark_started(&job.id, 4242).unwrap();
        let running = repo.find_by_id(&job.id).unwrap().unwrap();
        assert_eq!(running.state, JobState::Running);
        assert_eq!(running.pid, Some(4242));
        assert!(running.heartbeat.is_some());

        repo.mark_completed(&job.id, Some(0), None).unwrap();
        let done = repo.find_by_id(&job.id).unwrap().unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert!(done.finished_at.is_some());
        assert_eq!(done.exit_code.as_deref(), Some("0"));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let dir = tempdir().unwrap();
        let repo = repo_in(dir.path().to_path_buf());
        let job = repo
            .create(vec!["echo".into()], None, LoadLevel::Medium, |_| {})
            .unwrap();
        let err = repo.update_state(&job.id, JobState::Succeeded).unwrap_err();
        assert!(matches!(err, BarnError::InvalidStateTransition { .. }));
    }

    #[test]
    fn increment_retry_resets_to_queued_and_clears_result_fields() {
        let dir = tempdir().unwrap();
        let repo = repo_in(dir.path().to_path_buf());
        let job = repo
            .create(vec!["echo".into()], None, LoadLevel::Medium, |_| {})
            .unwrap();
        repo.mark_started(&job.id, 1).unwrap();
        repo.mark_completed(&job.id, Some(1), None).unwrap();

        repo.increment_retry(&job.id, Some(1), None, "2099-01-01T00:00:00Z")
            .unwrap();

        let retried = repo.find_by_id(&job.id).unwrap().unwrap();
        assert_eq!(retried.state, JobState::Queued);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.retry_at.as_deref(), Some("2099-01-01T00:00:00Z"));
        assert!(retried.started_at.is_none());
        assert!(retried.exit_code.is_none());
        assert_eq!(retried.retry_history.len(), 1);
        assert_eq!(retried.retry_history[0].attempt, 1);
    }

    #[test]
    fn find_all_skips_directories_missing_invariant_files() {
        let dir = tempdir().unwrap();
        let repo = repo_in(dir.path().to_path_buf());
        repo.create(vec!["echo".into()], None, LoadLevel::Medium, |_| {})
            .unwrap();
        std::fs::create_dir_all(dir.path().join("jobs").join("job-broken")).unwrap();

        let jobs = repo.find_all().unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn delete_removes_the_whole_directory() {
        let dir = tempdir().unwrap();
        let repo = repo_in(dir.path().to_path_buf());
        let job = repo
            .create(vec!["echo".into()], None, LoadLevel::Medium, |_| {})
            .unwrap();
        repo.delete(&job.id).unwrap();
        assert!(repo.find_by_id(&job.id).unwrap().is_none());
    }
}
