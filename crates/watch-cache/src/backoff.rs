//! # Exponential Backoff
//!
//! Retry delays for requeued work items and for sources that have to relist.
//! Each failure doubles the delay, starting at `base` and capped at `max`.
//! Sequence for base=500ms, max=5m: 0.5s, 1s, 2s, 4s, ... 256s, 300s (max).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Stateless exponential backoff calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `base` and never exceeding `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the retry that follows `failures` consecutive failures
    /// (0-indexed: the first retry waits `base`).
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(300))
    }
}

/// Per-item failure tracking on top of [`ExponentialBackoff`].
///
/// Every item backs off independently; a success (`forget`) resets it.
#[derive(Debug, Clone)]
pub struct ItemBackoff<T> {
    backoff: ExponentialBackoff,
    failures: HashMap<T, u32>,
}

impl<T: Eq + Hash> ItemBackoff<T> {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            backoff,
            failures: HashMap::new(),
        }
    }

    /// Records a failure of `item` and returns how long to wait before retrying it.
    pub fn next_delay(&mut self, item: T) -> Duration {
        let failures = self.failures.entry(item).or_insert(0);
        let delay = self.backoff.delay_for(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Number of failures recorded for `item` since it was last forgotten.
    pub fn failures(&self, item: &T) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }

    /// Reset the backoff of `item` to the initial state.
    pub fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }
}
