//! Orchestrates retries: triggered when a job reaches FAILED, re-queues it
//! via `JobRepository::increment_retry` when `RetryPolicy` says it's
//! eligible (spec §4.8).

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{format_rfc3339, parse_rfc3339, Clock};
use crate::job::JobState;
use crate::repository::JobRepository;
use crate::retry::{self, RetryDecision};

pub struct RetryController {
    repo: Arc<JobRepository>,
    clock: Arc<dyn Clock>,
}

impl RetryController {
    pub fn new(repo: Arc<JobRepository>, clock: Arc<dyn Clock>) -> Self {
        RetryController { repo, clock }
    }

    /// Evaluate every FAILED job and re-queue the ones eligible for retry.
    /// Idempotent: a FAILED job with `retry_count >= max_retries`, or one
    /// that's already been re-queued (no longer FAILED), is left alone.
    pub fn run_once(&self) -> crate::error::BarnResult<()> {
        for job in self.repo.find_by_state(JobState::Failed)? {
            let manifest = match self.repo.load_manifest(&job.id) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "retry controller: unreadable manifest, skipping");
                    continue;
                }
            };
            let exit_code: Option<i32> = job.exit_code.as_deref().and_then(|s| s.parse().ok());

            match retry::decide(&manifest, job.retry_count, exit_code) {
                RetryDecision::Exhausted => continue,
                RetryDecision::Retry { delay_seconds } => {
                    let now_secs = parse_rfc3339(&self.clock.now_rfc3339()).unwrap_or(0);
                    let retry_at = format_rfc3339(now_secs + delay_seconds);
                    if let Err(e) = self.repo.increment_retry(
                        &job.id,
                        exit_code,
                        job.error.clone(),
                        &retry_at,
                    ) {
                        tracing::warn!(job_id = %job.id, error = %e, "retry re-queue failed");
                    } else {
                        tracing::info!(job_id = %job.id, retry_at, "job re-queued for retry");
                    }
                }
            }
        }
        Ok(())
    }

    /// Run `run_once` on a fixed interval until `stop` is observed.
    pub fn run(&self, poll_interval: Duration, stop: &std::sync::atomic::AtomicBool) {
        use std::sync::atomic::Ordering;
        while !stop.load(Ordering::SeqCst) {
            if let Err(e) = self.run_once() {
                tracing::warn!(error = %e, "retry controller pass failed");
            }
            std::thread::sleep(poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::directories::BarnDirectories;
    use crate::job::LoadLevel;
    use tempfile::tempdir;

    fn repo_in(base: std::path::PathBuf) -> Arc<JobRepository> {
        let dirs = BarnDirectories::new(base);
        dirs.init_layout().unwrap();
        Arc::new(JobRepository::new(dirs, Arc::new(SystemClock)))
    }

    #[test]
    fn failed_job_under_max_retries_is_requeued() {
        let dir = tempdir().unwrap();
        let repo = repo_in(dir.path().to_path_buf());
        let job = repo
            .create(vec!["false".into()], None, LoadLevel::Medium, |m| {
                m.max_retries = 2;
            })
            .unwrap();
        repo.mark_started(&job.id, 1).unwrap();
        repo.mark_completed(&job.id, Some(1), None).unwrap();

        let controller = RetryController::new(Arc::clone(&repo), Arc::new(SystemClock));
        controller.run_once().unwrap();

        let after = repo.find_by_id(&job.id).unwrap().unwrap();
        assert_eq!(after.state, JobState::Queued);
        assert_eq!(after.retry_count, 1);
        assert!(after.retry_at.is_some());
    }

    #[test]
    fn max_retries_zero_stays_failed() {
        let dir = tempdir().unwrap();
        let repo = repo_in(dir.path().to_path_buf());
        let job = repo
            .create(vec!["false".into()], None, LoadLevel::Medium, |m| {
                m.max_retries = 0;
            })
            .unwrap();
        repo.mark_started(&job.id, 1).unwrap();
        repo.mark_completed(&job.id, Some(1), None).unwrap();

        let controller = RetryController::new(Arc::clone(&repo), Arc::new(SystemClock));
        controller.run_once().unwrap();

        let after = repo.find_by_id(&job.id).unwrap().unwrap();
        assert_eq!(after.state, JobState::Failed);
    }

    #[test]
    fn rerunning_on_already_requeued_job_is_a_no_op() {
        let dir = tempdir().unwrap();
        let repo = repo_in(dir.path().to_path_buf());
        let job = repo
            .create(vec!["false".into()], None, LoadLevel::Medium, |m| {
                m.max_retries = 2;
            })
            .unwrap();
        repo.mark_started(&job.id, 1).unwrap();
        repo.mark_completed(&job.id, Some(1), None).unwrap();

        let controller = RetryController::new(Arc::clone(&repo), Arc::new(SystemClock));
        controller.run_once().unwrap();
        controller.run_once().unwrap();

        let after = repo.find_by_id(&job.id).unwrap().unwrap();
        assert_eq!(after.retry_count, 1, "second pass must not double-retry");
    }
}
