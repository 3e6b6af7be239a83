//! Retry logic with exponential backoff for transient fetch failures.
//!
//! When a send fails, or the server answers with a transient status, the outcome is
//! classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::RateLimited`] - Server rate limiting (420 or 429)
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//!
//! The [`RetryPolicy`] then decides whether to retry based on failure type and attempt
//! count. The delay before retry `n` is `factor * 2^(n-1)`, capped at a maximum. A
//! Retry-After header on the failed response takes precedence over the computed delay.
//!
//! # Example
//!
//! ```
//! use reqcache::fetch::{FetchError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = FetchError::status("https://example.com/title.xml", 503);
//! let failure_type = classify_error(&error);
//!
//! match policy.should_retry(failure_type, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use super::FetchError;
use super::constants::{MAX_RETRY_BACKOFF, RETRY_BACKOFF_FACTOR, is_transient_status};

/// Default number of retries after the initial attempt.
pub const DEFAULT_HTTP_RETRIES: u32 = 3;

/// Classification of fetch failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: connection refused, timeout, 5xx server errors.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, invalid URL, TLS errors.
    Permanent,

    /// Server rate limiting (HTTP 420 or 429).
    RateLimited,
}

/// Decision on whether to retry a failed send.
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

/// Retry budget and backoff curve.
///
/// # Default Values
///
/// - `max_retries`: 3 (so at most 4 sends)
/// - `backoff_factor`: 500ms
/// - `max_backoff`: 120 seconds
///
/// With defaults, delays are 0.5s, 1s, 2s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    max_retries: u32,

    /// Delay before the first retry.
    backoff_factor: Duration,

    /// Maximum delay cap.
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_HTTP_RETRIES,
            backoff_factor: RETRY_BACKOFF_FACTOR,
            max_backoff: MAX_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    #[must_use]
    pub fn new(max_retries: u32, backoff_factor: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff_factor,
            max_backoff,
        }
    }

    /// Creates a policy with a custom retry budget, using defaults for other settings.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Returns the retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Determines whether to retry after attempt `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_retries = self.max_retries))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt > self.max_retries {
            debug!(attempt, "retries exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        let delay = self.backoff(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Delay before the retry following failed attempt `attempt`.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_factor
            .checked_mul(1_u32 << exponent)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Classifies an outcome into a failure type for retry decisions.
///
/// | Outcome | Type |
/// |--------|------|
/// | Status 420, 429 | RateLimited |
/// | Status 500 through 519 | Transient |
/// | Any other status | Permanent |
/// | Timeout | Transient |
/// | Network (most) | Transient |
/// | Network (TLS) | Permanent |
/// | Anything else | Permanent |
#[instrument]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::Status { status, .. } => classify_status(*status),
        FetchError::Timeout { .. } => FailureType::Transient,
        FetchError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        _ => FailureType::Permanent,
    }
}

/// Classifies an HTTP status code into a failure type.
#[must_use]
pub fn classify_status(status: u16) -> FailureType {
    match status {
        420 | 429 => FailureType::RateLimited,
        status if is_transient_status(status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
