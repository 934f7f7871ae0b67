//! Core data types: `Job`, `JobState`, `LoadLevel`, and the state machine.

use serde::{Deserialize, Serialize};

use crate::error::{BarnError, BarnResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadLevel {
    High,
    Medium,
    Low,
}

impl LoadLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadLevel::High => "HIGH",
            LoadLevel::Medium => "MEDIUM",
            LoadLevel::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> BarnResult<Self> {
        match s {
            "HIGH" => Ok(LoadLevel::High),
            "MEDIUM" => Ok(LoadLevel::Medium),
            "LOW" => Ok(LoadLevel::Low),
            other => Err(BarnError::Corrupted(format!(
                "invalid load_level: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Killed,
}

impl JobState {
    /// The lower-case token persisted on disk (invariant 2).
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
            JobState::Killed => "killed",
        }
    }

    pub fn parse(s: &str) -> BarnResult<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "canceled" => Ok(JobState::Canceled),
            "killed" => Ok(JobState::Killed),
            other => Err(BarnError::Corrupted(format!("invalid state: {other:?}"))),
        }
    }

    /// Terminal per spec §4.4: SUCCEEDED, CANCELED, KILLED, and FAILED
    /// (failed-without-retry; the retry path is a distinct FAILED->QUEUED
    /// transition gated to `RetryController`, not a generic allowed move).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled | JobState::Killed
        )
    }

    /// Validate a transition per the state machine in spec §4.4. `via_retry`
    /// must be set to allow the one FAILED->QUEUED edge, which is only ever
    /// taken by `RetryController`.
    pub fn validate_transition(&self, to: JobState, via_retry: bool) -> bool {
        use JobState::*;
        match (*self, to) {
            (Queued, Running) => true,
            (Queued, Canceled) => true,
            (Running, Succeeded) => true,
            (Running, Failed) => true,
            (Running, Canceled) => true,
            (Running, Killed) => true,
            (Failed, Queued) => via_retry,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only entry in a job's `retry_history` (JSONL on disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    pub attempt: u32,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// In-memory view of a job assembled from its directory's files. Not the
/// on-disk representation itself (that is one file per field, per
/// `StateIO`) — this is what `JobRepository` returns to callers.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub state: JobState,
    pub load_level: LoadLevel,
    pub tag: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub heartbeat: Option<String>,
    pub pid: Option<u32>,
    pub exit_code: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub retry_at: Option<String>,
    pub retry_history: Vec<RetryHistoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions_match_the_machine() {
        assert!(JobState::Queued.validate_transition(JobState::Running, false));
        assert!(JobState::Queued.validate_transition(JobState::Canceled, false));
        assert!(JobState::Running.validate_transition(JobState::Succeeded, false));
        assert!(JobState::Running.validate_transition(JobState::Failed, false));
        assert!(JobState::Running.validate_transition(JobState::Canceled, false));
        assert!(JobState::Running.validate_transition(JobState::Killed, false));
    }

    #[test]
    fn failed_to_queued_requires_retry_flag() {
        assert!(!JobState::Failed.validate_transition(JobState::Queued, false));
        assert!(JobState::Failed.validate_transition(JobState::Queued, true));
    }

    #[test]
    fn terminal_states_never_regress() {
        for terminal in [
            JobState::Succeeded,
            JobState::Canceled,
            JobState::Killed,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.validate_transition(JobState::Running, false));
            assert!(!terminal.validate_transition(JobState::Queued, true));
        }
    }

    #[test]
    fn state_tokens_are_lower_case_round_trip() {
        for s in [
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Canceled,
            JobState::Killed,
        ] {
            let token = s.as_str();
            assert_eq!(token, token.to_lowercase());
            assert_eq!(JobState::parse(token).unwrap(), s);
        }
    }
}
