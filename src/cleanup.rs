//! Age-based and disk-pressure-based removal of terminal jobs (spec §4.10).

use std::sync::Arc;

use crate::clock::{parse_rfc3339, Clock};
use crate::config::CleanupConfig;
use crate::job::{Job, JobState};
use crate::lock::JobLock;
use crate::repository::JobRepository;
use crate::usage_sampler::UsageSampler;

#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub cleaned: Vec<String>,
    pub bytes_freed: u64,
    pub dry_run: bool,
}

pub struct Cleanup {
    repo: Arc<JobRepository>,
    clock: Arc<dyn Clock>,
    config: CleanupConfig,
}

impl Cleanup {
    pub fn new(repo: Arc<JobRepository>, clock: Arc<dyn Clock>, config: CleanupConfig) -> Self {
        Cleanup { repo, clock, config }
    }

    pub fn is_eligible(&self, job: &Job, now_secs: u64) -> bool {
        if !job.state.is_terminal() {
            return false;
        }
        let Some(finished_at) = job.finished_at.as_deref().and_then(parse_rfc3339) else {
            return false;
        };
        let age_secs = now_secs.saturating_sub(finished_at);
        let threshold_hours = if job.state == JobState::Failed {
            if self.config.keep_failed_jobs {
                self.config.keep_failed_jobs_hours
            } else {
                self.config.max_age_hours
            }
        } else {
            self.config.max_age_hours
        };
        age_secs >= threshold_hours * 3600
    }

    /// Run one cleanup pass. `dry_run` reports the same candidate set it
    /// would delete, without deleting anything.
    pub fn run(&self, dry_run: bool) -> crate::error::BarnResult<CleanupReport> {
        let now_secs = parse_rfc3339(&self.clock.now_rfc3339()).unwrap_or(0);
        let all = self.repo.find_all()?;

        let mut cleaned = Vec::new();
        let mut bytes_freed = 0u64;

        for job in &all {
            if !self.is_eligible(job, now_secs) {
                continue;
            }
            let job_dir = match self.repo.directories().job_dir(&job.id) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let size = UsageSampler::dir_size_bytes(&job_dir);

            if dry_run {
                cleaned.push(job.id.clone());
                bytes_freed += size;
                continue;
            }

            let Some(_lock) = JobLock::try_acquire(&self.repo.directories().job_lock_path(&job.id))?
            else {
                tracing::info!(job_id = %job.id, "cleanup: lock contended, skipping");
                continue;
            };
            // Re-verify terminal state now that the lock is held, in case
            // something re-queued it between the scan and the lock.
            let Some(fresh) = self.repo.find_by_id(&job.id)? else {
                continue;
            };
            if !fresh.state.is_terminal() {
                continue;
            }
            if let Err(e) = self.repo.delete(&job.id) {
                tracing::warn!(job_id = %job.id, error = %e, "cleanup delete failed");
                continue;
            }
            tracing::info!(job_id = %job.id, bytes = size, "cleanup removed job");
            cleaned.push(job.id.clone());
            bytes_freed += size;
        }

        if !dry_run {
            self.enforce_disk_pressure(&mut cleaned, &mut bytes_freed)?;
        }

        Ok(CleanupReport {
            cleaned,
            bytes_freed,
            dry_run,
        })
    }

    fn enforce_disk_pressure(
        &self,
        cleaned: &mut Vec<String>,
        bytes_freed: &mut u64,
    ) -> crate::error::BarnResult<()> {
        let base = self.repo.directories().base();
        let max_bytes = self.config.max_disk_usage_gb * 1024 * 1024 * 1024;
        let mut total = UsageSampler::dir_size_bytes(base);
        if total <= max_bytes {
            return Ok(());
        }

        let mut candidates: Vec<Job> = self
            .repo
            .find_all()?
            .into_iter()
            .filter(|j| j.state.is_terminal() && !cleaned.contains(&j.id))
            .collect();
        candidates.sort_by(|a, b| {
            let a_at = a.finished_at.as_deref().unwrap_or("");
            let b_at = b.finished_at.as_deref().unwrap_or("");
            a_at.cmp(b_at)
        });

        for job in candidates {
            if total <= max_bytes {
                break;
            }
            let Some(_lock) = JobLock::try_acquire(&self.repo.directories().job_lock_path(&job.id))?
            else {
                continue;
            };
            let job_dir = self.repo.directories().job_dir(&job.id)?;
            let size = UsageSampler::dir_size_bytes(&job_dir);
            if self.repo.delete(&job.id).is_ok() {
                total = total.saturating_sub(size);
                *bytes_freed += size;
                cleaned.push(job.id.clone());
            }
        }

        if total > max_bytes {
            tracing::warn!(
                total_bytes = total,
                max_bytes,
                "disk usage still over threshold after cleanup"
            );
        }
        Ok(())
    }
}
