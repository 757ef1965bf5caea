//! Capture retry policy: fixed backoff below a consecutive-failure threshold,
//! a full renderer reload at the threshold.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Consecutive capture failures that trigger a recovery reload.
    pub max_consecutive_errors: u32,
    /// Wait before retrying a failed capture.
    pub backoff_ms: u64,
    /// A failed recovery reload ends the session. When false the failure is
    /// logged and the counter starts over.
    pub reload_failure_fatal: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            backoff_ms: 1_000,
            reload_failure_fatal: true,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// A zero threshold would reload on every failure; treat it as one.
    fn threshold(&self) -> u32 {
        self.max_consecutive_errors.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try capturing again after the backoff.
    Retry(Duration),
    /// Threshold reached: reload the renderer before the next capture.
    Reload,
}

/// Failure bookkeeping for one capture loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryState {
    pub consecutive: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

impl RetryState {
    /// Record a failure and decide what happens next.
    pub fn record_failure(&mut self, policy: &RetryPolicy, error: &str) -> RetryDecision {
        self.consecutive += 1;
        self.total_failures += 1;
        self.last_error = Some(error.to_string());

        if self.consecutive >= policy.threshold() {
            warn!(
                consecutive = self.consecutive,
                threshold = policy.threshold(),
                "Capture failure threshold reached, reloading renderer"
            );
            RetryDecision::Reload
        } else {
            warn!(
                consecutive = self.consecutive,
                threshold = policy.threshold(),
                backoff_ms = policy.backoff_ms,
                error,
                "Capture failed, will retry"
            );
            RetryDecision::Retry(policy.backoff())
        }
    }

    /// Any successful capture or recovery reload clears the streak.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}
