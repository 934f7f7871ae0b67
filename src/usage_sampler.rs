//! Periodic CPU/memory/disk/GPU sampling for one running job (spec §4.7).
//! Runs on the executor's cooperative timer; sampler failures are
//! swallowed (best-effort) so they never affect the job's outcome.

use std::path::Path;
use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

use crate::clock::Clock;
use crate::usage::UsageRecord;

/// Wraps a `sysinfo::System`, refreshed once per sample, scoped to one
/// job's whole process tree (root pid plus every descendant).
pub struct UsageSampler {
    system: Mutex<System>,
    root_pid: Pid,
}

impl UsageSampler {
    pub fn new(pid: u32) -> Self {
        let refresh = RefreshKind::nothing().with_processes(ProcessRefreshKind::everything());
        UsageSampler {
            system: Mutex::new(System::new_with_specifics(refresh)),
            root_pid: Pid::from_u32(pid),
        }
    }

    /// Sums CPU percent and resident memory across the job's whole process
    /// tree, per "CPU is process-tree CPU percent ... averaged over the
    /// sampling interval" (spec §4.7). `sysinfo` has no cross-platform
    /// process-group id, so the tree is walked via each process's parent
    /// pid instead (`Process::parent()`), which is the portable equivalent
    /// and covers the same descendants the Unix process-group kill in
    /// `executor.rs` targets. Returns `None` if the root pid is no longer
    /// visible to the OS (already exited between the caller's liveness
    /// check and this call).
    pub fn sample_process(&self) -> Option<(f64, u64)> {
        let mut system = self.system.lock().ok()?;
        system.refresh_processes(ProcessesToUpdate::All, true);

        system.process(self.root_pid)?;

        let mut pids = vec![self.root_pid];
        let mut i = 0;
        while i < pids.len() {
            let parent = pids[i];
            for (pid, process) in system.processes() {
                if process.parent() == Some(parent) && !pids.contains(pid) {
                    pids.push(*pid);
                }
            }
            i += 1;
        }

        let mut cpu_total = 0.0f64;
        let mut memory_total = 0u64;
        for pid in &pids {
            if let Some(process) = system.process(*pid) {
                cpu_total += process.cpu_usage() as f64;
                memory_total += process.memory();
            }
        }
        Some((cpu_total, memory_total))
    }

    /// Recursive byte size of `dir` (spec: disk = recursive size of
    /// `work/`). Best-effort: unreadable entries are skipped rather than
    /// failing the whole sample.
    pub fn dir_size_bytes(dir: &Path) -> u64 {
        let mut total = 0u64;
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_dir() {
                    total += Self::dir_size_bytes(&path);
                } else {
                    total += metadata.len();
                }
            }
        }
        total
    }

    pub fn take_sample(&self, clock: &dyn Clock, work_dir: &Path) -> Option<UsageRecord> {
        let (cpu_percent, memory_bytes) = self.sample_process()?;
        Some(UsageRecord {
            timestamp: clock.now_rfc3339(),
            cpu_percent,
            memory_bytes,
            disk_bytes: Self::dir_size_bytes(work_dir),
            gpu_percent: None,
            gpu_memory_bytes: None,
        })
    }
}
