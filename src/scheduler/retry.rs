//! Bounded retry policy with a fixed backoff schedule.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many times a failed item is re-attempted, and how long it waits
/// before each re-attempt becomes eligible.
///
/// The schedule is indexed by the attempt that just failed: the first
/// failure waits `backoff_ms[0]`, the second `backoff_ms[1]`, and so on;
/// attempts past the end of the schedule reuse its last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. `0` means fail on the first
    /// error.
    pub max_retries: u32,
    /// Backoff schedule in milliseconds.
    pub backoff_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: vec![1_000, 2_000, 4_000],
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: Vec::new(),
        }
    }

    /// Policy with retries but no delay; used by tests so runs stay fast.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_ms: Vec::new(),
        }
    }

    /// Whether another attempt is allowed after `retry_count` failures.
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Backoff before the attempt following failure number `failures`
    /// (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        if self.backoff_ms.is_empty() {
            return Duration::ZERO;
        }
        let index = (failures.max(1) as usize - 1).min(self.backoff_ms.len() - 1);
        Duration::from_millis(self.backoff_ms[index])
    }
}
