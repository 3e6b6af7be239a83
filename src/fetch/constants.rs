//! Constants for the fetch module (timeouts, rate limiting, retries).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large bodies).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default per-host request rate.
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 5.0;

/// Default size of chunks read while draining or chunk-reading a body.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Warning threshold for cumulative rate limit delay per host (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Backoff factor for retries: the n-th retry waits `factor * 2^(n-1)`.
pub const RETRY_BACKOFF_FACTOR: Duration = Duration::from_millis(500);

/// Upper bound for a single computed backoff delay.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(120);

/// Returns whether `status` is transient and worth retrying.
///
/// The set is fixed: 420, 429 and 500 through 519.
#[must_use]
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 420 | 429 | 500..=519)
}
