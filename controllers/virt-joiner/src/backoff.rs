//! # Fibonacci Backoff
//!
//! Delay between FreeIPA host deletion retries. Grows more slowly than an
//! exponential backoff so a flapping directory is retried often enough,
//! while a dead one is not hammered every poll cycle.
//!
//! Delays after 1, 2, 3, ... failures for a 10s poll interval capped at 300s:
//! 10s, 20s, 30s, 50s, 80s, 130s, 210s, 300s, 300s, ...

use std::time::Duration;

/// Fibonacci backoff calculator
#[derive(Debug, Clone, Copy)]
pub struct FibonacciBackoff {
    /// First (and second) delay in seconds
    min_secs: u64,
    /// Cap in seconds
    max_secs: u64,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min_secs` and capped at `max_secs`
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs: min_secs.max(1),
            max_secs: max_secs.max(min_secs.max(1)),
        }
    }

    /// Delay to wait after `failures` consecutive failures (stateless).
    ///
    /// `failures` 0 and 1 both give the minimum, then each delay is the sum of
    /// the previous two, capped at the maximum.
    #[must_use]
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures <= 1 {
            return Duration::from_secs(self.min_secs);
        }

        let mut prev = self.min_secs;
        let mut current = self.min_secs;
        for _ in 2..=failures {
            let next = prev.saturating_add(current);
            prev = current;
            current = next.min(self.max_secs);
            if current >= self.max_secs {
                break;
            }
        }

        Duration::from_secs(current)
    }
}
