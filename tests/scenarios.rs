//! End-to-end seed scenarios driving the library directly: a job is
//! created, the scheduler and retry controller are ticked by hand (no
//! daemon process, no signals), and the resulting on-disk state is
//! inspected. Unix-only: these scenarios spawn real subprocesses
//! (`sleep`, `sh`) the way the daemon itself does.
#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use std::sync::Mutex;

use barn::clock::{Clock, SystemClock};
use barn::config::Config;
use barn::directories::BarnDirectories;
use barn::executor::{CancelRequest, ProcessExecutor};
use barn::job::{JobState, LoadLevel};
use barn::repository::JobRepository;
use barn::retry_controller::RetryController;
use barn::scheduler::{InFlightRegistry, Scheduler};
use tempfile::tempdir;

fn build(base: std::path::PathBuf, mut config: Config) -> (Scheduler, Arc<JobRepository>, InFlightRegistry) {
    config.scheduler_poll_interval_ms = 50;
    let dirs = BarnDirectories::new(base);
    dirs.init_layout().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let repo = Arc::new(JobRepository::new(dirs.clone(), Arc::clone(&clock)));
    let executor = Arc::new(ProcessExecutor::new(
        dirs,
        Arc::clone(&repo),
        Arc::clone(&clock),
        config.clone(),
    ));
    let load_levels = Arc::new(Mutex::new(config.load_levels.clone()));
    let registry = InFlightRegistry::new();
    let scheduler = Scheduler::new(
        Arc::clone(&repo),
        executor,
        clock,
        config,
        load_levels,
        registry.clone(),
    );
    (scheduler, repo, registry)
}

fn wait_for_terminal(repo: &JobRepository, id: &str, timeout: Duration) -> barn::job::Job {
    let deadline = Instant::now() + timeout;
    loop {
        let job = repo.find_by_id(id).unwrap().unwrap();
        if job.state.is_terminal() {
            return job;
        }
        assert!(Instant::now() < deadline, "job {id} never reached a terminal state");
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Scenario 2 from the seed-test list: a job that fails once (flag file
/// absent) and succeeds on its next attempt after the retry delay elapses,
/// driven by ticking the scheduler and the retry controller by hand.
#[test]
fn retry_then_succeed() {
    let dir = tempdir().unwrap();
    let flag = dir.path().join("flag");
    let (scheduler, repo, _registry) = build(dir.path().to_path_buf(), Config::default());
    let retry_controller = RetryController::new(Arc::clone(&repo), Arc::new(SystemClock));

    let script = format!(
        "test -f {path} && exit 0 || {{ touch {path}; exit 1; }}",
        path = flag.display()
    );
    let job = repo
        .create(
            vec!["sh".into(), "-c".into(), script],
            None,
            LoadLevel::Medium,
            |m| {
                m.max_retries = 1;
                m.retry_delay_seconds = 1;
            },
        )
        .unwrap();

    scheduler.tick().unwrap();
    let first = wait_for_terminal(&repo, &job.id, Duration::from_secs(5));
    assert_eq!(first.state, JobState::Failed);
    assert!(flag.exists(), "first attempt should have created the flag file");

    retry_controller.run_once().unwrap();
    let requeued = repo.find_by_id(&job.id).unwrap().unwrap();
    assert_eq!(requeued.state, JobState::Queued);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.retry_at.is_some(), "retry_at must be set after requeue");

    // retry_at is ~1s in the future; the scheduler's own retry_at filter
    // means ticking immediately is a documented no-op, not a race.
    scheduler.tick().unwrap();
    assert_eq!(repo.find_by_id(&job.id).unwrap().unwrap().state, JobState::Queued);

    std::thread::sleep(Duration::from_millis(1100));
    scheduler.tick().unwrap();
    let second = wait_for_terminal(&repo, &job.id, Duration::from_secs(5));
    assert_eq!(second.state, JobState::Succeeded);
    assert_eq!(second.exit_code.as_deref(), Some("0"));
    assert_eq!(second.retry_history.len(), 1);
}

/// Scenario 3: a long-running job is killed gracefully. SIGTERM is
/// delivered to the whole process group; the child exits within the grace
/// window and the job ends CANCELED rather than KILLED.
#[test]
fn kill_graceful_cancels_a_running_job() {
    let dir = tempdir().unwrap();
    let mut config = Config::default();
    config.process_kill_grace_secs = 5;
    let (scheduler, repo, registry) = build(dir.path().to_path_buf(), config);

    let job = repo
        .create(
            vec!["sleep".into(), "300".into()],
            None,
            LoadLevel::Medium,
            |_| {},
        )
        .unwrap();

    scheduler.tick().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if repo.find_by_id(&job.id).unwrap().unwrap().state == JobState::Running {
            break;
        }
        assert!(Instant::now() < deadline, "job never started running");
        std::thread::sleep(Duration::from_millis(50));
    }

    let handle = registry
        .cancel_handle(&job.id)
        .expect("running job must have a cancel handle registered");
    handle.request(CancelRequest::Graceful);

    let finished = wait_for_terminal(&repo, &job.id, Duration::from_secs(10));
    assert_eq!(finished.state, JobState::Canceled);
    assert!(finished.finished_at.is_some());
}
