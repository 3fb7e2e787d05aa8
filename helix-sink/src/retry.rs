//! Retry bookkeeping for failed storage operations.
//!
//! Backoff is a single fixed delay. Nothing retries on its own: the writer
//! checks [`RetryState::is_ready`] on each tick and re-attempts the failed
//! step once the deadline has passed.

use std::time::Duration;

use crate::error::FailureKind;

/// State of a failed operation awaiting retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Step that failed most recently.
    pub kind: FailureKind,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Time of the most recent failure.
    pub failed_at_us: u64,
    /// Earliest time of the next attempt.
    pub retry_not_before_us: u64,
}

impl RetryState {
    /// Records a failure at `now_us`, starting a new backoff window.
    ///
    /// `previous` is the state from earlier failures of the same operation.
    #[must_use]
    pub const fn record_failure(
        previous: Option<Self>,
        kind: FailureKind,
        now_us: u64,
        backoff_us: u64,
    ) -> Self {
        let consecutive_failures = match previous {
            Some(state) => state.consecutive_failures.saturating_add(1),
            None => 1,
        };
        Self {
            kind,
            consecutive_failures,
            failed_at_us: now_us,
            retry_not_before_us: now_us.saturating_add(backoff_us),
        }
    }

    /// Returns true once the backoff window has passed.
    #[must_use]
    pub const fn is_ready(&self, now_us: u64) -> bool {
        now_us >= self.retry_not_before_us
    }

    /// Returns how long until the next attempt is allowed.
    #[must_use]
    pub const fn remaining(&self, now_us: u64) -> Duration {
        Duration::from_micros(self.retry_not_before_us.saturating_sub(now_us))
    }
}
