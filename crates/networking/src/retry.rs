//! Retry delay policies

use std::time::Duration;

/// Computes how long to wait before the next attempt
pub trait RetryPolicy: Send + Sync {
    /// Delay before retrying after `attempt` failed attempts (0-based)
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff: `min(base * 2^attempt, cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialRetry {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any delay
    pub cap: Duration,
}

impl Default for ExponentialRetry {
    fn default() -> Self {
        Self { base: Duration::from_millis(500), cap: Duration::from_secs(30) }
    }
}

impl ExponentialRetry {
    /// Create a policy with the given base and cap
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl RetryPolicy for ExponentialRetry {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}
