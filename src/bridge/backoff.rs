//! Reconnect delay calculation

use std::time::Duration;

/// Exponential backoff: `min(initial * 2^attempt, max)`.
///
/// Each side of the bridge owns one. The attempt counter advances on every
/// scheduled reconnect and returns to zero after a successful connect.
#[derive(Debug, Clone)]
pub struct BackoffStrategy {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl BackoffStrategy {
    /// A `max` below `initial` is raised to `initial`, so every delay is
    /// exactly `initial`. Config validation rejects that pair before it
    /// gets here; direct callers get the flat schedule.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Delay before the next reconnect, then advance the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        // Past 31 attempts the shift overflows and the cap applies
        let delay = 1u32
            .checked_shl(self.attempt)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max));

        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Forget previous failures
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
