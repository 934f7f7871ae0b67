//! `ProcessExecutor`: the full lifetime of one RUNNING job (spec §4.6).
//!
//! Spawns the child, redirects stdout/stderr, runs the heartbeat and usage
//! timers, enforces the manifest timeout, and terminates the whole
//! descendant tree on timeout or external cancellation — process group on
//! Unix, Job Object on Windows (the latter kept close to the teacher's own
//! `kill.rs`, which already solved this for a single-pid supervisor).

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::Config;
use crate::directories::BarnDirectories;
use crate::error::BarnResult;
use crate::lock::JobLock;
use crate::manifest::Manifest;
use crate::repository::JobRepository;
use crate::state_io;
use crate::usage_sampler::UsageSampler;

/// What an external caller is asking the executor to do to a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    /// SIGTERM, grace window, then SIGKILL; final state CANCELED.
    Graceful,
    /// Immediate SIGKILL; final state KILLED.
    Forced,
}

/// Shared handle an external `kill_job` caller uses to signal a running
/// executor. The Scheduler keeps a registry of `job_id -> CancelHandle` for
/// in-flight jobs.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<Mutex<Option<CancelRequest>>>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, req: CancelRequest) {
        *self.0.lock().unwrap() = Some(req);
    }

    fn peek(&self) -> Option<CancelRequest> {
        *self.0.lock().unwrap()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    ExitedNormally,
    TimedOut,
    Canceled,
    Killed,
}

pub struct ProcessExecutor {
    dirs: BarnDirectories,
    repo: Arc<JobRepository>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl ProcessExecutor {
    pub fn new(dirs: BarnDirectories, repo: Arc<JobRepository>, clock: Arc<dyn Clock>, config: Config) -> Self {
        ProcessExecutor {
            dirs,
            repo,
            clock,
            config,
        }
    }

    /// Run one job to completion. Caller (the Scheduler) holds `job_lock`
    /// for the whole call and drops it once this returns, releasing the
    /// per-job lock at end-of-RUNNING-lifetime per spec §4.5 step 5.
    pub fn run(&self, job_id: &str, manifest: &Manifest, cancel: CancelHandle, _job_lock: JobLock) {
        if let Err(e) = self.run_inner(job_id, manifest, &cancel) {
            tracing::error!(job_id, error = %e, "executor setup failed, marking job failed");
            let _ = self.mark_failed_with_sentinel(job_id, format!("spawn failed: {e}"), "spawn_failed");
        }
    }

    /// Marks a job FAILED with a symbolic `exit_code` token rather than a
    /// numeric one, for failures that never produced a real exit status
    /// (spawn failure, `wait()` failure). `mark_completed`'s `exit_code` is
    /// `Option<i32>` and only writes the field when `Some`, so the token is
    /// written directly afterward, the same pattern `Recovery` uses for
    /// `orphaned_process` (spec §3 invariant 4: exit_code is always set for
    /// a terminal FAILED job).
    fn mark_failed_with_sentinel(&self, job_id: &str, error: String, sentinel: &str) -> BarnResult<()> {
        self.repo.mark_completed(job_id, None, Some(error))?;
        let path = self.dirs.job_field_path(job_id, "exit_code")?;
        state_io::write_atomic(&path, sentinel)
    }

    fn run_inner(&self, job_id: &str, manifest: &Manifest, cancel: &CancelHandle) -> BarnResult<()> {
        let work_dir = self.dirs.job_work_dir(job_id)?;
        let stdout_log = self.dirs.job_stdout_log(job_id)?;
        let stderr_log = self.dirs.job_stderr_log(job_id)?;
        let progress_log = self.dirs.job_progress_log(job_id)?;
        let usage_csv = self.dirs.job_usage_csv(job_id)?;

        let mut command = Command::new(&manifest.command[0]);
        command
            .args(&manifest.command[1..])
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            command.pre_exec(|| {
                // Own process group so the whole descendant tree can be
                // signalled via `-pid` instead of just the direct child.
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| crate::error::BarnError::ProcessSpawnFailed(e.to_string()))?;
        let pid = child.id();

        self.repo.mark_started(job_id, pid)?;
        self.append_progress(&progress_log, &format!("started pid={pid}"));

        #[cfg(windows)]
        let job_object = windows_job::assign_to_job_object(job_id, pid);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child_done = Arc::new(AtomicBool::new(false));

        let stdout_thread = stdout.map(|s| spawn_copy_thread(s, stdout_log.clone()));
        let stderr_thread = stderr.map(|s| spawn_copy_thread(s, stderr_log.clone()));

        let stop_reason = Arc::new(Mutex::new(None::<StopReason>));
        let watcher = self.spawn_watcher(
            job_id.to_string(),
            pid,
            manifest.timeout_seconds,
            self.config.process_kill_grace_secs,
            Arc::clone(&child_done),
            cancel.clone(),
            Arc::clone(&stop_reason),
            progress_log.clone(),
            #[cfg(windows)]
            job_object.clone(),
        );

        let heartbeat_thread = self.spawn_heartbeat_thread(job_id.to_string(), Arc::clone(&child_done));
        let sampler_thread =
            self.spawn_sampler_thread(pid, work_dir.clone(), usage_csv, Arc::clone(&child_done));

        let wait_result = child.wait();
        child_done.store(true, Ordering::SeqCst);

        if let Some(t) = stdout_thread {
            let _ = t.join();
        }
        if let Some(t) = stderr_thread {
            let _ = t.join();
        }
        let _ = watcher.join();
        let _ = heartbeat_thread.join();
        let _ = sampler_thread.join();

        #[cfg(windows)]
        windows_job::close(job_object);

        let reason = stop_reason.lock().unwrap().unwrap_or(StopReason::ExitedNormally);
        self.finalize(job_id, &progress_log, reason, wait_result)
    }

    fn finalize(
        &self,
        job_id: &str,
        progress_log: &std::path::Path,
        reason: StopReason,
        wait_result: std::io::Result<std::process::ExitStatus>,
    ) -> BarnResult<()> {
        match reason {
            StopReason::Canceled => {
                self.append_progress(progress_log, "canceled");
                self.repo.mark_canceled(job_id)
            }
            StopReason::Killed => {
                let exit_code = exit_code_of(&wait_result);
                self.append_progress(progress_log, "killed");
                self.repo.mark_killed(job_id, exit_code)
            }
            StopReason::TimedOut => {
                self.append_progress(progress_log, "timed out");
                self.repo
                    .mark_completed(job_id, exit_code_of(&wait_result), Some("timeout".to_string()))
            }
            StopReason::ExitedNormally => match wait_result {
                Ok(status) => {
                    let code = exit_code_from_status(&status);
                    let error = if code == 0 {
                        None
                    } else {
                        Some(format!("Process exited with code {code}"))
                    };
                    self.append_progress(progress_log, &format!("exited code={code}"));
                    self.repo.mark_completed(job_id, Some(code), error)
                }
                Err(e) => {
                    self.append_progress(progress_log, &format!("wait failed: {e}"));
                    self.mark_failed_with_sentinel(job_id, format!("wait failed: {e}"), "wait_failed")
                }
            },
        }
    }

    fn append_progress(&self, path: &std::path::Path, line: &str) {
        let stamped = format!("{} {}", self.clock.now_rfc3339(), line);
        if let Err(e) = state_io::append_line(path, &stamped) {
            tracing::warn!(error = %e, "failed to append progress log line");
        }
    }

    fn spawn_heartbeat_thread(&self, job_id: String, done: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        let repo = Arc::clone(&self.repo);
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        std::thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                if done.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = repo.update_heartbeat(&job_id) {
                    tracing::warn!(job_id, error = %e, "heartbeat write failed");
                }
            }
        })
    }

    fn spawn_sampler_thread(
        &self,
        pid: u32,
        work_dir: PathBuf,
        usage_csv: PathBuf,
        done: Arc<AtomicBool>,
    ) -> std::thread::JoinHandle<()> {
        let clock = Arc::clone(&self.clock);
        let interval = Duration::from_secs(self.config.usage_sample_interval_secs.max(1));
        std::thread::spawn(move || {
            let sampler = UsageSampler::new(pid);
            while !done.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                if done.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(record) = sampler.take_sample(clock.as_ref(), &work_dir) {
                    if let Err(e) = crate::usage::append_usage_record(&usage_csv, &record) {
                        tracing::warn!(error = %e, "usage sample append failed");
                    }
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_watcher(
        &self,
        job_id: String,
        pid: u32,
        timeout_seconds: u64,
        grace_seconds: u64,
        done: Arc<AtomicBool>,
        cancel: CancelHandle,
        stop_reason: Arc<Mutex<Option<StopReason>>>,
        progress_log: PathBuf,
        #[cfg(windows)] job_object: windows_job::JobHandle,
    ) -> std::thread::JoinHandle<()> {
        let clock = Arc::clone(&self.clock);
        std::thread::spawn(move || {
            let start = Instant::now();
            loop {
                if done.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
                if done.load(Ordering::SeqCst) {
                    return;
                }

                if let Some(req) = cancel.peek() {
                    let reason = match req {
                        CancelRequest::Graceful => StopReason::Canceled,
                        CancelRequest::Forced => StopReason::Killed,
                    };
                    *stop_reason.lock().unwrap() = Some(reason);
                    let stamp = clock.now_rfc3339();
                    let _ = state_io::append_line(
                        &progress_log,
                        &format!("{stamp} job={job_id} cancel requested: {req:?}"),
                    );
                    terminate_tree(
                        pid,
                        req == CancelRequest::Forced,
                        grace_seconds,
                        &done,
                        #[cfg(windows)]
                        &job_object,
                    );
                    return;
                }

                if timeout_seconds > 0 && start.elapsed() >= Duration::from_secs(timeout_seconds) {
                    *stop_reason.lock().unwrap() = Some(StopReason::TimedOut);
                    let stamp = clock.now_rfc3339();
                    let _ = state_io::append_line(
                        &progress_log,
                        &format!("{stamp} job={job_id} timeout exceeded"),
                    );
                    terminate_tree(
                        pid,
                        false,
                        grace_seconds,
                        &done,
                        #[cfg(windows)]
                        &job_object,
                    );
                    return;
                }
            }
        })
    }
}

fn exit_code_of(wait_result: &std::io::Result<std::process::ExitStatus>) -> Option<i32> {
    wait_result.as_ref().ok().map(exit_code_from_status)
}

fn exit_code_from_status(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(code) = status.code() {
            return code;
        }
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
        -1
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

fn spawn_copy_thread<R: Read + Send + 'static>(mut reader: R, log_path: PathBuf) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        use std::io::Write;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path);
        let Ok(mut file) = file else { return };
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if file.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

/// Terminate the process and its descendants: SIGTERM-then-grace-then-KILL
/// on Unix via the process group, Job Object on Windows. `force` skips
/// straight to the hard kill.
fn terminate_tree(
    pid: u32,
    force: bool,
    grace_seconds: u64,
    done: &AtomicBool,
    #[cfg(windows)] job_object: &windows_job::JobHandle,
) {
    #[cfg(unix)]
    {
        unix_signal::terminate_process_group(pid, force, grace_seconds, done);
    }
    #[cfg(windows)]
    {
        let _ = force;
        windows_job::terminate(job_object, pid);
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (pid, force, grace_seconds, done);
    }
}

#[cfg(unix)]
mod unix_signal {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Send a signal to the whole process group (negative pid), matching
    /// the teacher's single-pid `libc::kill` idiom but extended to the
    /// group so descendants die too.
    fn kill_group(pid: u32, signum: i32) {
        unsafe {
            libc::kill(-(pid as libc::pid_t), signum);
        }
    }

    pub fn terminate_process_group(pid: u32, force: bool, grace_seconds: u64, done: &AtomicBool) {
        if force {
            kill_group(pid, libc::SIGKILL);
            return;
        }
        kill_group(pid, libc::SIGTERM);
        let deadline = std::time::Instant::now() + Duration::from_secs(grace_seconds.max(1));
        while std::time::Instant::now() < deadline {
            if done.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        if !done.load(Ordering::SeqCst) {
            kill_group(pid, libc::SIGKILL);
        }
    }
}

#[cfg(windows)]
mod windows_job {
    //! Windows process-tree termination via a Job Object, adapted from the
    //! teacher's `kill.rs` (named job per job-id, process assigned at
    //! spawn time, `TerminateJobObject` kills the whole tree atomically).

    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Process32First, Process32Next, PROCESSENTRY32, TH32CS_SNAPPROCESS,
    };
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, TerminateJobObject,
    };
    use windows::Win32::System::Threading::{
        OpenProcess, TerminateProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE,
    };
    use windows::core::HSTRING;

    #[derive(Clone)]
    pub struct JobHandle(Option<HANDLE>);

    pub fn assign_to_job_object(job_id: &str, pid: u32) -> JobHandle {
        unsafe {
            let name = HSTRING::from(format!("Barn-{job_id}"));
            let Ok(job) = CreateJobObjectW(None, &name) else {
                return JobHandle(None);
            };
            let Ok(process) = OpenProcess(PROCESS_TERMINATE | PROCESS_SET_QUOTA, false, pid) else {
                let _ = CloseHandle(job);
                return JobHandle(None);
            };
            let assigned = AssignProcessToJobObject(job, process).is_ok();
            let _ = CloseHandle(process);
            if assigned {
                JobHandle(Some(job))
            } else {
                let _ = CloseHandle(job);
                JobHandle(None)
            }
        }
    }

    /// Terminates the job object if assignment succeeded at spawn time;
    /// otherwise falls back to a snapshot-enumeration tree kill (same as
    /// the teacher's `kill.rs`), since a process already belonging to
    /// another job object cannot be reassigned and the whole tree must
    /// still go down.
    pub fn terminate(job: &JobHandle, pid: u32) {
        match job.0 {
            Some(handle) => unsafe {
                let _ = TerminateJobObject(handle, 1);
            },
            None => terminate_process_tree(pid),
        }
    }

    /// Recursively terminates `root_pid` and all its descendants via
    /// `CreateToolhelp32Snapshot`, walking the pid/parent-pid table
    /// breadth-first. Best-effort: a process that's already gone by the
    /// time it's opened is treated as already terminated.
    fn terminate_process_tree(root_pid: u32) {
        unsafe {
            let Ok(snapshot) = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) else {
                tracing::warn!(pid = root_pid, "toolhelp snapshot failed, cannot fall back to tree kill");
                return;
            };

            let mut entries: Vec<(u32, u32)> = Vec::new();
            let mut entry = PROCESSENTRY32 {
                dwSize: std::mem::size_of::<PROCESSENTRY32>() as u32,
                ..Default::default()
            };
            if Process32First(snapshot, &mut entry).is_ok() {
                loop {
                    entries.push((entry.th32ProcessID, entry.th32ParentProcessID));
                    entry = PROCESSENTRY32 {
                        dwSize: std::mem::size_of::<PROCESSENTRY32>() as u32,
                        ..Default::default()
                    };
                    if Process32Next(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }
            let _ = CloseHandle(snapshot);

            let mut to_kill = vec![root_pid];
            let mut i = 0;
            while i < to_kill.len() {
                let parent = to_kill[i];
                for &(child_pid, parent_pid) in &entries {
                    if parent_pid == parent && !to_kill.contains(&child_pid) {
                        to_kill.push(child_pid);
                    }
                }
                i += 1;
            }

            for &target_pid in to_kill.iter().rev() {
                match OpenProcess(PROCESS_TERMINATE, false, target_pid) {
                    Ok(h) => {
                        let _ = TerminateProcess(h, 1);
                        let _ = CloseHandle(h);
                    }
                    Err(_) => {
                        // Already gone; nothing to terminate.
                    }
                }
            }
        }
    }

    pub fn close(job: JobHandle) {
        if let Some(handle) = job.0 {
            unsafe {
                let _ = CloseHandle(handle);
            }
        }
    }
}
