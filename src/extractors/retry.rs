//! Attempt bookkeeping for source acquisition.

use std::time::Duration;

/// Where one acquisition call stands in its retry budget.
///
/// Threaded by value through the retry loop; `backoff` is the wait that follows a failure
/// of the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptState {
    /// 1-based number of the attempt in progress
    pub attempt_number: u32,
    /// Total attempts allowed, the first one included
    pub max_attempts: u32,
    /// Delay before the next attempt if this one fails
    pub backoff: Duration,
}

impl AttemptState {
    pub fn first(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            attempt_number: 1,
            max_attempts: max_attempts.max(1),
            backoff: base_backoff,
        }
    }

    pub fn has_remaining(&self) -> bool {
        self.attempt_number < self.max_attempts
    }

    /// State for the following attempt, with the backoff doubled
    pub fn next(self) -> Self {
        Self {
            attempt_number: self.attempt_number + 1,
            max_attempts: self.max_attempts,
            backoff: self.backoff.saturating_mul(2),
        }
    }
}
