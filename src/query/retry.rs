//! Attempt accounting for transient failures.
//!
//! [`RetryPolicy`] holds the configured limits; [`RetryState`] counts the
//! attempts of one logical request. Each transient failure is offered to
//! [`RetryPolicy::on_transient`], which either grants another attempt with a
//! delay or reports that the budget is spent.
//!
//! Waits imposed by the rate-limit budget are not failures and never go
//! through this module, so an hour-long reset wait cannot exhaust the budget.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use querier_core::query::{RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::new(2, Duration::from_secs(3));
//! let mut state = policy.start();
//!
//! assert!(matches!(
//!     policy.on_transient(&mut state, None),
//!     RetryDecision::Retry { attempt: 2, .. }
//! ));
//! assert!(matches!(
//!     policy.on_transient(&mut state, None),
//!     RetryDecision::DoNotRetry { .. }
//! ));
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use super::constants::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, MAX_RETRY_AFTER};

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Limits for transient-failure retries.
///
/// # Default Values
///
/// - `max_attempts`: 10
/// - `retry_delay`: 3 seconds
/// - `max_retry_after`: 1 hour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Fixed wait between attempts when the server gives no hint.
    retry_delay: Duration,

    /// Upper bound for server-provided wait hints.
    max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_after: MAX_RETRY_AFTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy; `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
            max_retry_after: MAX_RETRY_AFTER,
        }
    }

    /// Creates a policy with a custom max_attempts, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the fixed delay between attempts.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Starts counting a new logical request at attempt 1.
    #[must_use]
    pub fn start(&self) -> RetryState {
        RetryState { attempt: 1 }
    }

    /// Delay for a rate-limited response that gave no reset information:
    /// `retry_delay` scaled by the attempt that just failed.
    #[must_use]
    pub fn rate_limit_backoff(&self, state: &RetryState) -> Duration {
        self.retry_delay.saturating_mul(state.attempt)
    }

    /// Consumes an attempt for a transient failure.
    ///
    /// `hint` is a server-provided wait (Retry-After), capped at
    /// `max_retry_after`; without one the fixed `retry_delay` is used.
    #[instrument(
        skip(self, state),
        fields(attempt = state.attempt, max_attempts = self.max_attempts)
    )]
    pub fn on_transient(&self, state: &mut RetryState, hint: Option<Duration>) -> RetryDecision {
        if state.attempt >= self.max_attempts {
            debug!("max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = hint.map_or(self.retry_delay, |hint| hint.min(self.max_retry_after));
        state.attempt += 1;

        debug!(
            next_attempt = state.attempt,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: state.attempt,
        }
    }
}

/// Attempt counter for one logical request (one page).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
}

impl RetryState {
    /// The attempt currently in flight (1-indexed).
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
