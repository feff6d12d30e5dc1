//! Reconnect delay schedule

use std::time::Duration;

/// First delay after a failed or dropped connection
pub const INITIAL_DELAY: Duration = Duration::from_millis(2000);

/// Upper bound for any single delay
pub const MAX_DELAY: Duration = Duration::from_millis(30000);

/// Growth factor applied after each failure
pub const MULTIPLIER: f64 = 1.5;

/// Exponential backoff state for one observer connection
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    delay: Duration,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_limits(INITIAL_DELAY, MAX_DELAY, MULTIPLIER)
    }

    pub fn with_limits(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            delay: initial.min(max),
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt; grows the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.attempts = self.attempts.saturating_add(1);
        self.delay = self.delay.mul_f64(self.multiplier).min(self.max);
        delay
    }

    /// Back to the initial delay after a confirmed connection
    pub fn reset(&mut self) {
        self.delay = self.initial.min(self.max);
        self.attempts = 0;
    }

    /// Failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current(&self) -> Duration {
        self.delay
    }
}
