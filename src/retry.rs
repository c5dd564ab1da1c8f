//! Capped exponential backoff for mutation replays.

use crate::queue::QueuedMutation;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Backoff schedule keyed on a mutation's failed attempt count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), 2.0)
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: if multiplier.is_finite() {
                multiplier.max(1.0)
            } else {
                1.0
            },
        }
    }

    /// Policy that never defers a mutation.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Delay to wait after `attempts` failed replays before the next one.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempts - 1).min(63) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Earliest time the mutation may be replayed by a lifecycle drain.
    pub fn next_attempt_at(&self, mutation: &QueuedMutation) -> Option<DateTime<Utc>> {
        let last = mutation.last_attempt_at?;
        let delay = chrono::Duration::from_std(self.delay_for(mutation.attempts))
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        Some(last.checked_add_signed(delay).unwrap_or(last))
    }

    pub fn is_due(&self, mutation: &QueuedMutation, now: DateTime<Utc>) -> bool {
        match self.next_attempt_at(mutation) {
            Some(next) => now >= next,
            None => true,
        }
    }
}
