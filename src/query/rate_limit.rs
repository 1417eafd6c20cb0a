//! Rate-limit budget tracking for one credential.
//!
//! The remote API reports its budget on every response through the
//! `x-ratelimit-limit`, `x-ratelimit-remaining` and `x-ratelimit-reset`
//! headers. [`RateLimitGuard`] records the most recent report and blocks
//! callers until the reset time once the budget is spent.
//!
//! # Sharing
//!
//! The budget belongs to the credential, not to a query. Engines that use the
//! same credential concurrently must share one guard (wrap it in `Arc`):
//! [`RateLimitGuard::admit`] holds an async mutex while inspecting the budget,
//! so two callers can never both conclude they have headroom that in reality
//! overlaps.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use querier_core::query::{QueryEngine, RateLimitGuard, RetryPolicy};
//! # use querier_core::query::{HttpTransport, TransportSettings};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = Arc::new(RateLimitGuard::new());
//! let transport = Arc::new(HttpTransport::new("token", &TransportSettings::default())?);
//! let repos = QueryEngine::new(transport.clone(), RetryPolicy::default())
//!     .with_rate_limit_guard(Arc::clone(&guard));
//! let members = QueryEngine::new(transport, RetryPolicy::default())
//!     .with_rate_limit_guard(guard);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::constants::{
    CANCEL_POLL_INTERVAL, MAX_RESET_WAIT, MAX_RETRY_AFTER, RESET_PROGRESS_INTERVAL,
    RESET_SAFETY_MARGIN,
};
use super::error::QueryError;
use super::transport::{HeaderMap, RawResponse};

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Budget reported by one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Requests permitted per window.
    pub limit: u64,
    /// Requests left in the current window.
    pub remaining: u64,
    /// When the window resets, in seconds since the Unix epoch.
    pub reset_epoch: u64,
}

impl RateLimitStatus {
    /// Parses the budget triple; `None` unless all three headers are present and numeric.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let field = |name: &str| headers.get(name)?.trim().parse::<u64>().ok();
        Some(Self {
            limit: field(LIMIT_HEADER)?,
            remaining: field(REMAINING_HEADER)?,
            reset_epoch: field(RESET_HEADER)?,
        })
    }

    /// Whether no requests remain in the current window.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Reads only the reset epoch header (present on some 403/429 responses
/// that omit the rest of the triple).
#[must_use]
pub fn reset_epoch_from_headers(headers: &HeaderMap) -> Option<u64> {
    headers.get(RESET_HEADER)?.trim().parse().ok()
}

/// Reads only the remaining-requests header.
#[must_use]
pub fn remaining_from_headers(headers: &HeaderMap) -> Option<u64> {
    headers.get(REMAINING_HEADER)?.trim().parse().ok()
}

/// Tracks and enforces the rate-limit budget of one credential.
#[derive(Debug)]
pub struct RateLimitGuard {
    /// Added on top of every reset wait.
    safety_margin: Duration,
    /// How often long waits log progress.
    progress_interval: Duration,
    /// Most recent budget report.
    last_status: Mutex<Option<RateLimitStatus>>,
    /// Serializes budget inspection between engines sharing this guard.
    admission: tokio::sync::Mutex<()>,
}

impl Default for RateLimitGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitGuard {
    /// Creates a guard with the default one-second safety margin.
    #[must_use]
    pub fn new() -> Self {
        Self::with_safety_margin(RESET_SAFETY_MARGIN)
    }

    /// Creates a guard with a custom safety margin (one millisecond to one hour).
    #[must_use]
    pub fn with_safety_margin(safety_margin: Duration) -> Self {
        Self {
            safety_margin: safety_margin.clamp(Duration::from_millis(1), MAX_RETRY_AFTER),
            progress_interval: RESET_PROGRESS_INTERVAL,
            last_status: Mutex::new(None),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the safety margin added to reset waits.
    #[must_use]
    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    /// Returns the most recently observed budget, if any.
    #[must_use]
    pub fn last_status(&self) -> Option<RateLimitStatus> {
        *self
            .last_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Extracts the budget from `response` and records it.
    ///
    /// Responses without the headers leave the recorded budget untouched and
    /// return `None` (unknown is a legal state).
    pub fn observe(&self, response: &RawResponse) -> Option<RateLimitStatus> {
        let status = RateLimitStatus::from_headers(response.headers());
        match status {
            Some(status) => {
                debug!(
                    limit = status.limit,
                    remaining = status.remaining,
                    reset = status.reset_epoch,
                    "API status"
                );
                *self
                    .last_status
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(status);
            }
            None => debug!("failed to check API status; no rate-limit headers"),
        }
        status
    }

    /// Waits until wall-clock time passes `reset_epoch` plus the safety margin.
    ///
    /// Never waits less than the safety margin, even for resets in the past.
    /// Progress is logged periodically during long waits.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Cancelled`] if `interrupted` is raised while waiting,
    /// or [`QueryError::UnexpectedShape`] if the reset lies more than
    /// [`MAX_RESET_WAIT`] in the future. An implausible reset is forgotten.
    #[instrument(skip(self, interrupted))]
    pub async fn await_reset(
        &self,
        reset_epoch: u64,
        interrupted: Option<&AtomicBool>,
    ) -> Result<(), QueryError> {
        let wait = match duration_until_epoch(reset_epoch) {
            Some(until_reset) if until_reset <= MAX_RESET_WAIT => {
                until_reset.saturating_add(self.safety_margin)
            }
            _ => {
                self.forget_reset(reset_epoch);
                warn!(reset_epoch, "rate-limit reset is implausibly far away");
                return Err(QueryError::unexpected_shape(format!(
                    "rate-limit reset epoch {reset_epoch} is more than {} s away",
                    MAX_RESET_WAIT.as_secs()
                )));
            }
        };
        info!(
            reset_epoch,
            wait_secs = wait.as_secs(),
            "API needs a break; waiting for rate-limit reset"
        );

        let deadline = Instant::now().checked_add(wait).ok_or_else(|| {
            QueryError::unexpected_shape(format!(
                "rate-limit wait of {} s is not representable",
                wait.as_secs()
            ))
        })?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            pause(remaining.min(self.progress_interval), interrupted).await?;
            let left = deadline.saturating_duration_since(Instant::now());
            if !left.is_zero() {
                info!(remaining_secs = left.as_secs(), "still waiting for rate-limit reset");
            }
        }

        self.forget_reset(reset_epoch);
        info!("rate-limit reset reached; ready");
        Ok(())
    }

    /// Admission point before every request.
    ///
    /// If the last recorded budget is exhausted and its reset has not passed,
    /// waits for the reset while holding the admission lock, so other engines
    /// sharing this guard queue behind the wait instead of spending requests
    /// that would be refused.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Cancelled`] if `interrupted` is raised while waiting.
    pub async fn admit(&self, interrupted: Option<&AtomicBool>) -> Result<(), QueryError> {
        let _admission = self.admission.lock().await;
        if let Some(status) = self.last_status()
            && status.is_exhausted()
            && status.reset_epoch >= now_epoch()
        {
            info!("API usage limit reached; holding requests until reset");
            self.await_reset(status.reset_epoch, interrupted).await?;
        }
        Ok(())
    }

    /// Waits for the reset when the last known budget has `required` or fewer
    /// requests left.
    ///
    /// Use before starting a batch whose request count can be estimated. An
    /// unknown budget returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Cancelled`] if `interrupted` is raised while waiting.
    pub async fn ensure_headroom(
        &self,
        required: u64,
        interrupted: Option<&AtomicBool>,
    ) -> Result<(), QueryError> {
        let _admission = self.admission.lock().await;
        let Some(status) = self.last_status() else {
            debug!(required, "rate-limit budget unknown; not waiting");
            return Ok(());
        };
        if status.remaining > required {
            return Ok(());
        }
        warn!(
            remaining = status.remaining,
            required, "rate-limit budget depleted; waiting for reset"
        );
        self.await_reset(status.reset_epoch, interrupted).await
    }

    /// Drops the recorded budget once its window has been waited out.
    fn forget_reset(&self, reset_epoch: u64) {
        let mut last = self
            .last_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.is_some_and(|status| status.reset_epoch <= reset_epoch) {
            *last = None;
        }
    }
}

/// Sleeps for `duration`, checking `interrupted` between short slices.
///
/// # Errors
///
/// Returns [`QueryError::Cancelled`] as soon as `interrupted` is observed raised.
pub(crate) async fn pause(
    duration: Duration,
    interrupted: Option<&AtomicBool>,
) -> Result<(), QueryError> {
    let Some(flag) = interrupted else {
        tokio::time::sleep(duration).await;
        return Ok(());
    };

    let deadline = Instant::now() + duration;
    loop {
        if flag.load(Ordering::SeqCst) {
            return Err(QueryError::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        tokio::time::sleep(remaining.min(CANCEL_POLL_INTERVAL)).await;
    }
}

/// Current wall-clock time in whole seconds since the Unix epoch.
#[must_use]
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Time left until `epoch`; zero once it has passed, `None` if `epoch` is
/// beyond what `SystemTime` can represent.
fn duration_until_epoch(epoch: u64) -> Option<Duration> {
    let reset = UNIX_EPOCH.checked_add(Duration::from_secs(epoch))?;
    Some(
        reset
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use querier_core::query::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        return match datetime.duration_since(SystemTime::now()) {
            Ok(duration) if duration > MAX_RETRY_AFTER => {
                warn!(
                    delay_secs = duration.as_secs(),
                    max_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                Some(MAX_RETRY_AFTER)
            }
            Ok(duration) => Some(duration),
            // Date is in the past
            Err(_) => Some(Duration::ZERO),
        };
    }

    debug!(value = %header_value, "unparseable Retry-After header");
    None
}
