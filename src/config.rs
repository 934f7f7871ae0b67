//! Typed configuration with defaults, overridable via `BARN_<SECTION>_<KEY>`
//! environment variables. Read once at daemon startup; the core components
//! themselves never re-read the environment (spec'd contract), they only
//! consume the resolved `Config` values passed down.

#[derive(Debug, Clone)]
pub struct LoadLevelLimits {
    pub max_high_jobs: u32,
    pub max_medium_jobs: u32,
    pub max_low_jobs: u32,
}

impl LoadLevelLimits {
    /// Legacy fallback: derive per-category limits from a single
    /// `max_concurrent_jobs` via the 1:4:16 ratio, remainder to LOW.
    pub fn from_legacy_max_concurrent(max_concurrent_jobs: u32) -> Self {
        let unit = max_concurrent_jobs / 21;
        let high = unit;
        let medium = unit * 4;
        let low = max_concurrent_jobs.saturating_sub(high + medium);
        LoadLevelLimits {
            max_high_jobs: high,
            max_medium_jobs: medium,
            max_low_jobs: low,
        }
    }
}

impl Default for LoadLevelLimits {
    fn default() -> Self {
        LoadLevelLimits::from_legacy_max_concurrent(21)
    }
}

#[derive(Debug, Clone)]
pub struct RetryDefaults {
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub retry_backoff_multiplier: f64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        RetryDefaults {
            max_retries: 0,
            retry_delay_seconds: 5,
            retry_backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub cleanup_interval_minutes: u64,
    pub max_age_hours: u64,
    pub keep_failed_jobs: bool,
    pub keep_failed_jobs_hours: u64,
    pub max_disk_usage_gb: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            cleanup_interval_minutes: 60,
            max_age_hours: 24,
            keep_failed_jobs: true,
            keep_failed_jobs_hours: 168,
            max_disk_usage_gb: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub load_levels: LoadLevelLimits,
    pub retry: RetryDefaults,
    pub cleanup: CleanupConfig,
    pub scheduler_poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub usage_sample_interval_secs: u64,
    pub stale_heartbeat_threshold_secs: u64,
    pub process_kill_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            load_levels: LoadLevelLimits::default(),
            retry: RetryDefaults::default(),
            cleanup: CleanupConfig::default(),
            scheduler_poll_interval_ms: 500,
            heartbeat_interval_secs: 5,
            usage_sample_interval_secs: 5,
            stale_heartbeat_threshold_secs: 30,
            process_kill_grace_secs: 10,
        }
    }
}

impl Config {
    /// Load defaults, then apply `BARN_<SECTION>_<KEY>` overrides from the
    /// process environment. Malformed overrides are logged and ignored,
    /// never a hard failure (startup should not die over a typo'd env var).
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(std::env::vars());
        cfg
    }

    fn apply_env_overrides(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (key, value) in vars {
            if let Some(rest) = key.strip_prefix("BARN_") {
                self.apply_one(rest, &value);
            }
        }
    }

    fn apply_one(&mut self, key: &str, value: &str) {
        macro_rules! set_u32 {
            ($field:expr) => {
                match value.parse() {
                    Ok(v) => $field = v,
                    Err(_) => tracing::warn!(key, value, "ignoring unparseable config override"),
                }
            };
        }
        macro_rules! set_u64 {
            ($field:expr) => {
                match value.parse() {
                    Ok(v) => $field = v,
                    Err(_) => tracing::warn!(key, value, "ignoring unparseable config override"),
                }
            };
        }
        match key {
            "LOAD_LEVELS_MAX_HIGH_JOBS" => set_u32!(self.load_levels.max_high_jobs),
            "LOAD_LEVELS_MAX_MEDIUM_JOBS" => set_u32!(self.load_levels.max_medium_jobs),
            "LOAD_LEVELS_MAX_LOW_JOBS" => set_u32!(self.load_levels.max_low_jobs),
            "RETRY_MAX_RETRIES" => set_u32!(self.retry.max_retries),
            "RETRY_DELAY_SECONDS" => set_u64!(self.retry.retry_delay_seconds),
            "RETRY_BACKOFF_MULTIPLIER" => match value.parse() {
                Ok(v) => self.retry.retry_backoff_multiplier = v,
                Err(_) => tracing::warn!(key, value, "ignoring unparseable config override"),
            },
            "CLEANUP_INTERVAL_MINUTES" => set_u64!(self.cleanup.cleanup_interval_minutes),
            "CLEANUP_MAX_AGE_HOURS" => set_u64!(self.cleanup.max_age_hours),
            "CLEANUP_KEEP_FAILED_JOBS" => match value.parse() {
                Ok(v) => self.cleanup.keep_failed_jobs = v,
                Err(_) => tracing::warn!(key, value, "ignoring unparseable config override"),
            },
            "CLEANUP_KEEP_FAILED_JOBS_HOURS" => set_u64!(self.cleanup.keep_failed_jobs_hours),
            "CLEANUP_MAX_DISK_USAGE_GB" => set_u64!(self.cleanup.max_disk_usage_gb),
            "SCHEDULER_POLL_INTERVAL_MS" => set_u64!(self.scheduler_poll_interval_ms),
            "EXECUTOR_HEARTBEAT_INTERVAL_SECS" => set_u64!(self.heartbeat_interval_secs),
            "EXECUTOR_USAGE_SAMPLE_INTERVAL_SECS" => set_u64!(self.usage_sample_interval_secs),
            "RECOVERY_STALE_HEARTBEAT_THRESHOLD_SECS" => {
                set_u64!(self.stale_heartbeat_threshold_secs)
            }
            "EXECUTOR_PROCESS_KILL_GRACE_SECS" => set_u64!(self.process_kill_grace_secs),
            other => tracing::warn!(key = other, "unknown config override, ignoring"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_ratio_splits_1_4_16_with_remainder_to_low() {
        let limits = LoadLevelLimits::from_legacy_max_concurrent(21);
        assert_eq!(limits.max_high_jobs, 1);
        assert_eq!(limits.max_medium_jobs, 4);
        assert_eq!(limits.max_low_jobs, 16);
    }

    #[test]
    fn env_override_applies_known_key() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(
            vec![("BARN_SCHEDULER_POLL_INTERVAL_MS".to_string(), "750".to_string())].into_iter(),
        );
        assert_eq!(cfg.scheduler_poll_interval_ms, 750);
    }

    #[test]
    fn env_override_ignores_malformed_value() {
        let mut cfg = Config::default();
        let before = cfg.scheduler_poll_interval_ms;
        cfg.apply_env_overrides(
            vec![(
                "BARN_SCHEDULER_POLL_INTERVAL_MS".to_string(),
                "not-a-number".to_string(),
            )]
            .into_iter(),
        );
        assert_eq!(cfg.scheduler_poll_interval_ms, before);
    }
}
