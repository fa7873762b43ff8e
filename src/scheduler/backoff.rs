//! Exponential backoff between evaluation attempts.

use std::time::Duration;

/// Delay before the first retry.
pub const BASE_DELAY_SECS: f64 = 0.5;

/// Exponential backoff: `base * factor^retry`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base_secs: f64,
    factor: f64,
}

impl ExponentialBackoff {
    pub fn new(factor: f64) -> Self {
        Self {
            base_secs: BASE_DELAY_SECS,
            factor,
        }
    }

    /// Returns the wait after the failed attempt with zero-based index `retry`.
    pub fn duration(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.base_secs * self.factor.powi(exp);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}
