//! Linear retry backoff for monitor I/O (socket bind, watch setup, directory
//! reads). Each consecutive failure adds one step up to a ceiling; a success
//! resets the count.

use std::cmp;
use std::time::Duration;

const BACKOFF_STEP_MS: u64 = 500;
const BACKOFF_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct RetryBackoff {
    failures: u32,
    step_ms: u64,
    max_ms: u64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(BACKOFF_STEP_MS),
            Duration::from_millis(BACKOFF_MAX_MS),
        )
    }
}

impl RetryBackoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            failures: 0,
            step_ms: duration_ms(step),
            max_ms: duration_ms(max),
        }
    }

    /// Records a failure and returns how long to wait before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        Duration::from_millis(compute_backoff(self.failures, self.step_ms, self.max_ms))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

fn compute_backoff(failures: u32, step_ms: u64, max_ms: u64) -> u64 {
    let backoff = step_ms.saturating_mul(u64::from(failures));
    cmp::min(backoff, max_ms)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
