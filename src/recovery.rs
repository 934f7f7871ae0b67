//! Startup reconciliation of on-disk state with live processes (spec §4.9).
//! Runs exactly once, before the scheduler's first tick.

use std::sync::Arc;

use sysinfo::{Pid, System};

use crate::clock::{parse_rfc3339, Clock};
use crate::job::{Job, JobState};
use crate::repository::JobRepository;

pub struct Recovery {
    repo: Arc<JobRepository>,
    clock: Arc<dyn Clock>,
    stale_heartbeat_threshold_secs: u64,
}

impl Recovery {
    pub fn new(repo: Arc<JobRepository>, clock: Arc<dyn Clock>, stale_heartbeat_threshold_secs: u64) -> Self {
        Recovery {
            repo,
            clock,
            stale_heartbeat_threshold_secs,
        }
    }

    /// Reconcile every job directory. Idempotent: replaying this on an
    /// already-recovered directory (no RUNNING jobs left orphaned) is a
    /// no-op.
    pub fn run(&self) -> crate::error::BarnResult<()> {
        let now_secs = parse_rfc3339(&self.clock.now_rfc3339()).unwrap_or(0);
        for job in self.repo.find_all()? {
            if job.state != JobState::Running {
                continue;
            }
            if self.is_orphan(&job, now_secs) {
                tracing::warn!(job_id = %job.id, "recovering orphaned job");
                if let Err(e) = self.repo.mark_completed(
                    &job.id,
                    None,
                    Some("daemon restart orphaned this job".to_string()),
                ) {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to mark orphaned job");
                } else {
                    // mark_completed records exit_code only if Some(..); the
                    // orphan marker is the symbolic `orphaned_process` token
                    // rather than a numeric code, so it's written directly.
                    let path = self.repo.directories().job_field_path(&job.id, "exit_code");
                    if let Ok(path) = path {
                        let _ = crate::state_io::write_atomic(&path, "orphaned_process");
                    }
                }
            }
        }
        Ok(())
    }

    fn is_orphan(&self, job: &Job, now_secs: u64) -> bool {
        let stale = job
            .heartbeat
            .as_deref()
            .and_then(parse_rfc3339)
            .map(|hb| now_secs.saturating_sub(hb) > self.stale_heartbeat_threshold_secs)
            .unwrap_or(true);
        if stale {
            return true;
        }
        match job.pid {
            Some(pid) => !self.process_alive_and_matches(pid, &job.id),
            None => true,
        }
    }

    /// Best-effort liveness + identity check to avoid acting on a PID that
    /// has been reused by an unrelated process since the prior daemon
    /// crashed: the process must exist AND its name/command must match the
    /// job's own manifest (spec §4.9: "the process command matches
    /// (best-effort check to avoid PID reuse)").
    fn process_alive_and_matches(&self, pid: u32, job_id: &str) -> bool {
        let mut system = System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
        let Some(process) = system.process(Pid::from_u32(pid)) else {
            return false;
        };

        let Ok(manifest) = self.repo.load_manifest(job_id) else {
            // Manifest unreadable: can't verify identity either way. Treat
            // mere liveness as a match rather than orphaning a job over a
            // transient read failure.
            return true;
        };
        let Some(expected) = manifest.command.first() else {
            return true;
        };
        let expected_name = std::path::Path::new(expected)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| expected.clone());

        let name_matches = process.name().to_string_lossy() == expected_name;
        let cmd_matches = process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy() == expected_name || arg.to_string_lossy() == *expected);

        name_matches || cmd_matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::directories::BarnDirectories;
    use crate::job::LoadLevel;
    use crate::state_io;
    use tempfile::tempdir;

    fn repo_in(base: std::path::PathBuf, clock: Arc<dyn Clock>) -> Arc<JobRepository> {
        let dirs = BarnDirectories::new(base);
        dirs.init_layout().unwrap();
        Arc::new(JobRepository::new(dirs, clock))
    }

    #[test]
    fn dead_pid_with_stale_heartbeat_is_marked_orphaned() {
        let dir = tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(10_000));
        let repo = repo_in(dir.path().to_path_buf(), Arc::clone(&clock));

        let job = repo
            .create(vec!["sleep".into(), "300".into()], None, LoadLevel::Medium, |_| {})
            .unwrap();
        repo.mark_started(&job.id, 999_999).unwrap();
        // Back-date the heartbeat by forcing it through state_io directly
        // (an hour before "now" on the fake clock).
        let hb_path = repo.directories().job_field_path(&job.id, "heartbeat").unwrap();
        state_io::write_atomic(&hb_path, &crate::clock::format_rfc3339(10_000 - 3600)).unwrap();

        let recovery = Recovery::new(Arc::clone(&repo), clock, 30);
        recovery.run().unwrap();

        let after = repo.find_by_id(&job.id).unwrap().unwrap();
        assert_eq!(after.state, JobState::Failed);
        assert_eq!(after.exit_code.as_deref(), Some("orphaned_process"));
        assert!(after.finished_at.is_some());
    }

    #[test]
    fn reused_pid_with_mismatched_command_is_marked_orphaned_despite_fresh_heartbeat() {
        let dir = tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(10_000));
        let repo = repo_in(dir.path().to_path_buf(), Arc::clone(&clock));

        let job = repo
            .create(vec!["sleep".into(), "300".into()], None, LoadLevel::Medium, |_| {})
            .unwrap();
        // The current test process is definitely alive and its heartbeat is
        // fresh, but its pid now belongs to the test binary, not `sleep` --
        // simulating the OS having recycled the job's original pid.
        repo.mark_started(&job.id, std::process::id()).unwrap();

        let recovery = Recovery::new(Arc::clone(&repo), clock, 30);
        recovery.run().unwrap();

        let after = repo.find_by_id(&job.id).unwrap().unwrap();
        assert_eq!(after.state, JobState::Failed);
        assert_eq!(after.exit_code.as_deref(), Some("orphaned_process"));
    }

    #[test]
    fn recovery_is_idempotent_on_already_recovered_job() {
        let dir = tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(10_000));
        let repo = repo_in(dir.path().to_path_buf(), Arc::clone(&clock));
        let job = repo
            .create(vec!["sleep".into(), "300".into()], None, LoadLevel::Medium, |_| {})
            .unwrap();
        repo.mark_started(&job.id, 999_999).unwrap();

        let recovery = Recovery::new(Arc::clone(&repo), Arc::clone(&clock), 30);
        recovery.run().unwrap();
        let first = repo.find_by_id(&job.id).unwrap().unwrap();

        recovery.run().unwrap();
        let second = repo.find_by_id(&job.id).unwrap().unwrap();
        assert_eq!(first.state, second.state);
        assert_eq!(first.finished_at, second.finished_at);
    }
}
