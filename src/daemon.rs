//! Daemon lifecycle: startup sequence, signal handling, graceful shutdown.
//!
//! Startup order (spec §4.9, §7): init base directory layout -> acquire the
//! scheduler lock (abort if contended) -> run Recovery once -> start the
//! Scheduler, RetryController, and Cleanup loops on their own threads.
//! SIGTERM stops the scheduler and waits for running jobs to reach a
//! terminal state before exit; SIGHUP reloads whitelists/concurrency limits
//! without touching already-running jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use signal_hook::consts::{SIGHUP, SIGTERM};
use signal_hook::iterator::Signals;

use crate::classifier::{LoadClassifier, LoadWhitelists};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, LoadLevelLimits};
use crate::directories::BarnDirectories;
use crate::error::{BarnError, BarnResult};
use crate::executor::ProcessExecutor;
use crate::lock::SchedulerLock;
use crate::recovery::Recovery;
use crate::repository::JobRepository;
use crate::retry_controller::RetryController;
use crate::scheduler::{InFlightRegistry, Scheduler};

pub struct Daemon {
    pub repo: Arc<JobRepository>,
    pub classifier: Arc<Mutex<LoadClassifier>>,
    pub registry: InFlightRegistry,
    scheduler: Arc<Scheduler>,
    config: Config,
    load_levels: Arc<Mutex<LoadLevelLimits>>,
    config_dir: std::path::PathBuf,
    _scheduler_lock: SchedulerLock,
    stop: Arc<AtomicBool>,
}

impl Daemon {
    /// Initializes the base directory layout, acquires the scheduler lock,
    /// and runs Recovery once. Returns `Err` only for the conditions spec
    /// §7 says should abort the daemon: failure to acquire the scheduler
    /// lock or to initialize the base directory.
    pub fn bootstrap(base_dir: std::path::PathBuf, config_dir: std::path::PathBuf, config: Config) -> BarnResult<Self> {
        let dirs = BarnDirectories::new(base_dir);
        dirs.init_layout()?;

        let scheduler_lock = SchedulerLock::try_acquire(&dirs.scheduler_lock_path())?
            .ok_or_else(|| BarnError::LockContended("another barn daemon already holds scheduler.lock".to_string()))?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let repo = Arc::new(JobRepository::new(dirs.clone(), Arc::clone(&clock)));

        let recovery = Recovery::new(
            Arc::clone(&repo),
            Arc::clone(&clock),
            config.stale_heartbeat_threshold_secs,
        );
        recovery.run()?;

        let whitelists = LoadWhitelists::load_from_dir(&config_dir);
        let classifier = Arc::new(Mutex::new(LoadClassifier::new(whitelists)));

        let executor = Arc::new(ProcessExecutor::new(
            dirs,
            Arc::clone(&repo),
            Arc::clone(&clock),
            config.clone(),
        ));
        let load_levels = Arc::new(Mutex::new(config.load_levels.clone()));
        let registry = InFlightRegistry::new();
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&repo),
            executor,
            clock,
            config.clone(),
            Arc::clone(&load_levels),
            registry.clone(),
        ));

        Ok(Daemon {
            repo,
            classifier,
            registry,
            scheduler,
            config,
            load_levels,
            config_dir,
            _scheduler_lock: scheduler_lock,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run the daemon until SIGTERM (or an explicit `stop()` call from an
    /// embedder) is observed. Blocks the calling thread.
    pub fn run(&self) -> BarnResult<()> {
        let scheduler = Arc::clone(&self.scheduler);
        let scheduler_thread = std::thread::spawn(move || scheduler.run());

        let retry_controller = RetryController::new(Arc::clone(&self.repo), Arc::new(SystemClock));
        let retry_stop = Arc::new(AtomicBool::new(false));
        let retry_stop_for_thread = Arc::clone(&retry_stop);
        let retry_poll = Duration::from_millis(self.config.scheduler_poll_interval_ms.max(1));
        let retry_thread = std::thread::spawn(move || {
            retry_controller.run(retry_poll, &retry_stop_for_thread);
        });

        let cleanup = crate::cleanup::Cleanup::new(
            Arc::clone(&self.repo),
            Arc::new(SystemClock),
            self.config.cleanup.clone(),
        );
        let cleanup_stop = Arc::clone(&self.stop);
        let cleanup_interval = Duration::from_secs(self.config.cleanup.cleanup_interval_minutes.max(1) * 60);
        let cleanup_thread = std::thread::spawn(move || {
            while !cleanup_stop.load(Ordering::SeqCst) {
                std::thread::sleep(cleanup_interval);
                if cleanup_stop.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = cleanup.run(false) {
                    tracing::warn!(error = %e, "periodic cleanup failed");
                }
            }
        });

        self.handle_signals_until_term()?;

        tracing::info!("shutdown requested, stopping scheduler dispatch");
        self.scheduler.request_stop();
        retry_stop.store(true, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);

        // Grace-terminate any jobs still in flight, then wait for their
        // terminal-state writes before the process exits.
        for (job_id, handle) in self.in_flight_snapshot() {
            tracing::info!(job_id, "sending graceful shutdown signal to in-flight job");
            handle.request(crate::executor::CancelRequest::Graceful);
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(self.config.process_kill_grace_secs + 5);
        while self.registry.count() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }

        let _ = scheduler_thread.join();
        let _ = retry_thread.join();
        let _ = cleanup_thread.join();
        Ok(())
    }

    fn in_flight_snapshot(&self) -> Vec<(String, crate::executor::CancelHandle)> {
        // `InFlightRegistry` doesn't expose iteration directly beyond count
        // and lookup by id; the daemon only needs best-effort fan-out here,
        // so it consults the job repository's own RUNNING view instead.
        self.repo
            .find_by_state(crate::job::JobState::Running)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|j| self.registry.cancel_handle(&j.id).map(|h| (j.id, h)))
            .collect()
    }

    fn handle_signals_until_term(&self) -> BarnResult<()> {
        let mut signals = Signals::new([SIGTERM, SIGHUP])
            .map_err(|e| BarnError::IoError { path: "signals".into(), source: e })?;
        for signal in signals.forever() {
            match signal {
                SIGTERM => {
                    tracing::info!("received SIGTERM");
                    return Ok(());
                }
                SIGHUP => {
                    tracing::info!("received SIGHUP, reloading whitelists and concurrency limits");
                    self.reload();
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Re-read whitelists and concurrency limits. Never affects jobs
    /// already RUNNING (spec §6).
    pub fn reload(&self) {
        let whitelists = LoadWhitelists::load_from_dir(&self.config_dir);
        *self.classifier.lock().unwrap() = LoadClassifier::new(whitelists);

        let fresh = Config::from_env().load_levels;
        tracing::info!(
            max_high_jobs = fresh.max_high_jobs,
            max_medium_jobs = fresh.max_medium_jobs,
            max_low_jobs = fresh.max_low_jobs,
            "reloaded concurrency limits"
        );
        *self.load_levels.lock().unwrap() = fresh;
    }

    /// Programmatic stop, for embedding/tests that don't want to rely on
    /// process signals.
    pub fn stop(&self) {
        self.scheduler.request_stop();
        self.stop.store(true, Ordering::SeqCst);
    }
}
