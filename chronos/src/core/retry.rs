//! Crash retry budget and exponential backoff.

use std::time::Duration;

/// Backoff policy for consecutive crashes of the wrapped tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive crashes tolerated before the session fails.
    pub max_crash_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_crash_retries: 5,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th consecutive crash (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Counter of consecutive crashes, reset on every successful turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryBudget {
    consecutive_crashes: u32,
}

impl RetryBudget {
    pub fn consecutive_crashes(&self) -> u32 {
        self.consecutive_crashes
    }

    pub fn record_success(&mut self) {
        self.consecutive_crashes = 0;
    }

    /// Count a crash. Returns the backoff to wait before retrying, or `None`
    /// when the budget is exhausted.
    pub fn record_crash(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        self.consecutive_crashes += 1;
        if self.consecutive_crashes >= policy.max_crash_retries {
            return None;
        }
        Some(policy.backoff(self.consecutive_crashes))
    }
}
