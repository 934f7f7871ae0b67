//! Retry eligibility decision and next-retry-timestamp computation
//! (spec §4.8, steps 1-3). Orchestration (re-queuing, history bookkeeping)
//! lives in `retry_controller`; this module is pure decision logic.

use crate::manifest::Manifest;

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Remain FAILED: either retries are exhausted or the exit code is not
    /// in the configured retry set.
    Exhausted,
    /// Retry after `delay_seconds`.
    Retry { delay_seconds: u64 },
}

/// Decide whether `retry_count` (current count, before this attempt) should
/// retry given `exit_code`, and if so compute the backoff delay.
pub fn decide(manifest: &Manifest, retry_count: u32, exit_code: Option<i32>) -> RetryDecision {
    if retry_count >= manifest.max_retries {
        return RetryDecision::Exhausted;
    }
    // A process that failed for a reason other than a plain exit code
    // (spawn failure, internal error) has no exit code to check against
    // `retry_on_exit_codes`; treat it as retryable by the exit-code rule
    // only when an exit code is actually known.
    if let Some(code) = exit_code {
        if !manifest.exit_code_is_retryable(code) {
            return RetryDecision::Exhausted;
        }
    }
    let delay = backoff_delay_seconds(
        manifest.retry_delay_seconds,
        manifest.retry_backoff_multiplier,
        retry_count,
    );
    RetryDecision::Retry {
        delay_seconds: delay,
    }
}

/// `delay = retry_delay_seconds * retry_backoff_multiplier ^ retry_count`.
pub fn backoff_delay_seconds(base_delay_seconds: u64, multiplier: f64, retry_count: u32) -> u64 {
    let delay = base_delay_seconds as f64 * multiplier.powi(retry_count as i32);
    delay.round().max(0.0) as u64
}
