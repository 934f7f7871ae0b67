//! The immutable job manifest, written once at job creation.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BarnError, BarnResult, IoContext};
use crate::job::LoadLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub command: Vec<String>,
    pub tag: Option<String>,
    pub load_level: LoadLevel,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    #[serde(default)]
    pub retry_on_exit_codes: Vec<i32>,
}

fn default_retry_delay_seconds() -> u64 {
    5
}

fn default_retry_backoff_multiplier() -> f64 {
    2.0
}

impl Manifest {
    pub fn new(command: Vec<String>, tag: Option<String>, load_level: LoadLevel) -> BarnResult<Self> {
        if command.is_empty() {
            return Err(BarnError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        Ok(Manifest {
            command,
            tag,
            load_level,
            timeout_seconds: 0,
            max_retries: 0,
            retry_delay_seconds: default_retry_delay_seconds(),
            retry_backoff_multiplier: default_retry_backoff_multiplier(),
            retry_on_exit_codes: Vec::new(),
        })
    }

    /// Whether `exit_code` is eligible for retry per the configured list.
    /// An empty list means "retry any non-zero exit" (spec §9 open
    /// question, adopted as the documented semantics).
    pub fn exit_code_is_retryable(&self, exit_code: i32) -> bool {
        if self.retry_on_exit_codes.is_empty() {
            exit_code != 0
        } else {
            self.retry_on_exit_codes.contains(&exit_code)
        }
    }

    pub fn write(&self, path: &Path) -> BarnResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BarnError::Corrupted(format!("failed to serialize manifest: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).io_ctx(parent)?;
        }
        // Written once at creation and never mutated afterwards, so a plain
        // write (not the StateIO atomic-rename path) is sufficient: there is
        // no concurrent writer to race against.
        std::fs::write(path, json).io_ctx(path)
    }

    pub fn read(path: &Path) -> BarnResult<Self> {
        let raw = std::fs::read(path).io_ctx(path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| BarnError::Corrupted(format!("unparseable manifest {path:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_command_is_rejected() {
        let err = Manifest::new(vec![], None, LoadLevel::Medium).unwrap_err();
        assert!(matches!(err, BarnError::InvalidArgument(_)));
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let m = Manifest::new(vec!["echo".into(), "hi".into()], Some("t1".into()), LoadLevel::High)
            .unwrap();
        m.write(&path).unwrap();
        let read_back = Manifest::read(&path).unwrap();
        assert_eq!(read_back.command, m.command);
        assert_eq!(read_back.tag, m.tag);
    }

    #[test]
    fn empty_retry_on_exit_codes_means_retry_any_nonzero() {
        let mut m = Manifest::new(vec!["x".into()], None, LoadLevel::Low).unwrap();
        m.retry_on_exit_codes = vec![];
        assert!(m.exit_code_is_retryable(1));
        assert!(!m.exit_code_is_retryable(0));
    }

    #[test]
    fn nonempty_retry_on_exit_codes_is_exact_match() {
        let mut m = Manifest::new(vec!["x".into()], None, LoadLevel::Low).unwrap();
        m.retry_on_exit_codes = vec![2];
        assert!(!m.exit_code_is_retryable(1));
        assert!(m.exit_code_is_retryable(2));
    }

    #[test]
    fn unknown_fields_are_ignored_forward_compatibly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{"command":["x"],"tag":null,"load_level":"LOW","future_field":123}"#,
        )
        .unwrap();
        let m = Manifest::read(&path).unwrap();
        assert_eq!(m.command, vec!["x".to_string()]);
    }
}
