//! Selects queued jobs obeying per-category concurrency limits and
//! dispatches them to the executor on worker threads (spec §4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::{Config, LoadLevelLimits};
use crate::executor::{CancelHandle, ProcessExecutor};
use crate::job::{JobState, LoadLevel};
use crate::lock::JobLock;
use crate::repository::JobRepository;

fn limit_for(limits: &LoadLevelLimits, level: LoadLevel) -> u32 {
    match level {
        LoadLevel::High => limits.max_high_jobs,
        LoadLevel::Medium => limits.max_medium_jobs,
        LoadLevel::Low => limits.max_low_jobs,
    }
}

/// Registry of in-flight jobs' cancel handles, consulted by an external
/// `kill_job` caller and by `Scheduler::running_count` bookkeeping.
#[derive(Default, Clone)]
pub struct InFlightRegistry {
    inner: Arc<Mutex<HashMap<String, CancelHandle>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, job_id: String, handle: CancelHandle) {
        self.inner.lock().unwrap().insert(job_id, handle);
    }

    fn remove(&self, job_id: &str) {
        self.inner.lock().unwrap().remove(job_id);
    }

    pub fn cancel_handle(&self, job_id: &str) -> Option<CancelHandle> {
        self.inner.lock().unwrap().get(job_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

pub struct Scheduler {
    repo: Arc<JobRepository>,
    executor: Arc<ProcessExecutor>,
    clock: Arc<dyn Clock>,
    config: Config,
    load_levels: Arc<Mutex<LoadLevelLimits>>,
    registry: InFlightRegistry,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    /// `load_levels` is shared with the daemon so a SIGHUP reload can swap
    /// in freshly re-read concurrency limits without restarting the
    /// scheduler (spec §6).
    pub fn new(
        repo: Arc<JobRepository>,
        executor: Arc<ProcessExecutor>,
        clock: Arc<dyn Clock>,
        config: Config,
        load_levels: Arc<Mutex<LoadLevelLimits>>,
        registry: InFlightRegistry,
    ) -> Self {
        Scheduler {
            repo,
            executor,
            clock,
            config,
            load_levels,
            registry,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run the tick loop until `stop` is set. Blocking; call from the
    /// dedicated scheduler loop thread (spec §5).
    pub fn run(&self) {
        let poll = Duration::from_millis(self.config.scheduler_poll_interval_ms.max(1));
        while !self.stop.load(Ordering::SeqCst) {
            if let Err(e) = self.tick() {
                tracing::warn!(error = %e, "scheduler tick failed");
            }
            std::thread::sleep(poll);
        }
    }

    pub fn tick(&self) -> crate::error::BarnResult<()> {
        let now = self.clock.now_rfc3339();

        let mut queued: Vec<_> = self
            .repo
            .find_by_state(JobState::Queued)?
            .into_iter()
            .filter(|j| j.retry_at.as_deref().is_none_or(|at| at.as_str() <= now.as_str()))
            .collect();
        // FIFO by created_at ascending; lexicographic id tie-break.
        queued.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let running = self.repo.find_by_state(JobState::Running)?;
        let mut running_counts: HashMap<LoadLevel, u32> = HashMap::new();
        for job in &running {
            *running_counts.entry(job.load_level).or_insert(0) += 1;
        }

        let limits = self.load_levels.lock().unwrap().clone();
        for job in queued {
            let limit = limit_for(&limits, job.load_level);
            let count = running_counts.entry(job.load_level).or_insert(0);
            if *count >= limit {
                continue;
            }

            let Some(job_lock) = JobLock::try_acquire(&self.repo.directories().job_lock_path(&job.id))?
            else {
                continue;
            };

            let manifest = match self.repo.load_manifest(&job.id) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "skipping job with unreadable manifest");
                    continue;
                }
            };

            // The per-job lock is now held for this job's whole RUNNING
            // lifetime, so a concurrent tick can no longer pick it up even
            // though its on-disk state is still QUEUED at this instant; the
            // executor's own `mark_started` performs the QUEUED->RUNNING
            // transition once it has a real pid (spec §4.6).
            *count += 1;

            let cancel = CancelHandle::new();
            self.registry.insert(job.id.clone(), cancel.clone());

            let executor = Arc::clone(&self.executor);
            let registry = self.registry.clone();
            let job_id = job.id.clone();
            std::thread::spawn(move || {
                executor.run(&job_id, &manifest, cancel, job_lock);
                registry.remove(&job_id);
            });
        }
        Ok(())
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
