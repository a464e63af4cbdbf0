//! Retry delay schedule

use std::time::Duration;

/// Default ceiling on a single delay
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Doubling retry delays, capped, for a fixed number of retries
///
/// `new(2000, 3)` yields 2s, 4s, 8s and then `None`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    next: Duration,
    ceiling: Duration,
    remaining: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay_ms: u64, retries: u32) -> Self {
        ExponentialBackoff {
            next: Duration::from_millis(base_delay_ms),
            ceiling: DEFAULT_MAX_DELAY,
            remaining: retries,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.ceiling = max_delay;
        self
    }

    /// Delay before the next retry, or None once retries are spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delay = self.next.min(self.ceiling);
        self.next = self.next.saturating_mul(2);
        Some(delay)
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}
