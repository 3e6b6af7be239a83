//! Per-host rate limiting for outgoing requests.
//!
//! This module provides the [`RateLimiter`] struct which enforces a minimum interval
//! between requests to the same origin (scheme, host and port). Requests to different
//! origins never wait on each other.
//!
//! The limiter keeps a ledger of the earliest permitted send time per origin. A caller
//! reserves its slot *before* sleeping, so concurrent callers targeting one origin are
//! serialized without a gap between the check and the reservation.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use reqcache::fetch::{RateLimiter, Throttle};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = Arc::new(RateLimiter::from_requests_per_second(2.0)?);
//!
//! // First request to an origin proceeds immediately
//! limiter.acquire("https://example.com/file1.xml");
//!
//! // Second request to the same origin waits ~500ms
//! limiter.acquire("https://example.com/file2.xml");
//!
//! // Request to a different origin proceeds immediately
//! limiter.acquire("https://other.com/file.xml");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};
use crate::config::ConfigError;

/// Spacing policy consulted by the engine before every network send.
pub trait Throttle: Send + Sync + fmt::Debug {
    /// Blocks until a request to `url` may be sent and returns how long it waited.
    fn acquire(&self, url: &str) -> Duration;

    /// Records a server-mandated delay (from a Retry-After header) for `url`'s origin.
    fn record_rate_limit(&self, url: &str, delay: Duration) {
        let _ = (url, delay);
    }
}

/// Per-origin rate limiter.
///
/// `RateLimiter` is `Send + Sync`; share one instance through `Arc` between engines that
/// should throttle together. Independent instances never affect each other.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum time between two sends to the same origin.
    min_interval: Duration,

    /// Whether rate limiting is disabled (infinite request rate).
    disabled: bool,

    /// Origin -> ledger slot. A slot is mutated under its shard lock, which makes
    /// the read-then-reserve step atomic.
    hosts: DashMap<String, HostSlot>,
}

#[derive(Debug)]
struct HostSlot {
    /// Earliest instant the next request may be sent. Only ever moves forward.
    next_permitted: Instant,

    /// Total delay imposed on this origin, used to warn about excessive throttling.
    cumulative_delay: Duration,
}

impl HostSlot {
    fn add_cumulative_delay(&mut self, delay: Duration) -> Duration {
        self.cumulative_delay = self.cumulative_delay.saturating_add(delay);
        self.cumulative_delay
    }
}

impl RateLimiter {
    /// Creates a rate limiter enforcing `min_interval` between requests to one origin.
    ///
    /// A zero interval disables limiting.
    #[must_use]
    #[instrument(skip_all, fields(interval_ms = min_interval.as_millis()))]
    pub fn new(min_interval: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            min_interval,
            disabled: min_interval.is_zero(),
            hosts: DashMap::new(),
        }
    }

    /// Creates a disabled rate limiter that applies no delays.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Creates a rate limiter allowing `requests_per_second` requests per origin.
    ///
    /// `f64::INFINITY` disables limiting.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] unless `requests_per_second` is strictly
    /// positive.
    pub fn from_requests_per_second(requests_per_second: f64) -> Result<Self, ConfigError> {
        if requests_per_second.is_nan() || requests_per_second <= 0.0 {
            return Err(ConfigError::invalid_value(
                "requests_per_second",
                format!("{requests_per_second} is not strictly positive"),
            ));
        }
        if requests_per_second.is_infinite() {
            return Ok(Self::disabled());
        }

        let interval = Duration::try_from_secs_f64(1.0 / requests_per_second).map_err(|_| {
            ConfigError::invalid_value(
                "requests_per_second",
                format!("{requests_per_second} yields an unrepresentable interval"),
            )
        })?;
        Ok(Self::new(interval))
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the minimum interval between requests to one origin.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Reserves the next send slot for `url`'s origin and returns how long the caller
    /// has to wait before using it. Does not sleep.
    ///
    /// The first request to an origin gets a zero wait.
    #[must_use]
    pub fn reserve(&self, url: &str) -> Duration {
        self.reserve_at(&host_key(url), Instant::now())
    }

    fn reserve_at(&self, host: &str, now: Instant) -> Duration {
        if self.disabled {
            return Duration::ZERO;
        }

        match self.hosts.entry(host.to_string()) {
            Entry::Vacant(vacant) => {
                debug!(host, "first request to host - no delay");
                vacant.insert(HostSlot {
                    next_permitted: now + self.min_interval,
                    cumulative_delay: Duration::ZERO,
                });
                Duration::ZERO
            }
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let wait = slot.next_permitted.saturating_duration_since(now);
                slot.next_permitted = now + wait + self.min_interval;

                if !wait.is_zero() {
                    let cumulative = slot.add_cumulative_delay(wait);
                    debug!(
                        host,
                        delay_ms = wait.as_millis(),
                        cumulative_ms = cumulative.as_millis(),
                        "reserved delayed slot"
                    );
                    if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                        warn!(
                            host,
                            cumulative_delay_secs = cumulative.as_secs(),
                            "excessive rate limiting - consider reducing request volume to this host"
                        );
                    }
                }
                wait
            }
        }
    }

    fn record_rate_limit_at(&self, host: &str, delay: Duration, now: Instant) {
        let target = now + delay;
        let mut slot = self.hosts.entry(host.to_string()).or_insert(HostSlot {
            next_permitted: now,
            cumulative_delay: Duration::ZERO,
        });
        if target > slot.next_permitted {
            slot.next_permitted = target;
        }
        let cumulative = slot.add_cumulative_delay(delay);

        debug!(
            host,
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );
        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                host,
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - site may be under heavy load"
            );
        }
    }
}

impl Throttle for RateLimiter {
    #[instrument(skip(self), fields(host))]
    fn acquire(&self, url: &str) -> Duration {
        if self.disabled {
            return Duration::ZERO;
        }

        let host = host_key(url);
        tracing::Span::current().record("host", host.as_str());

        let wait = self.reserve_at(&host, Instant::now());
        if !wait.is_zero() {
            info!(host = %host, wait_secs = wait.as_secs_f64(), "rate limiting request");
            thread::sleep(wait);
        }
        wait
    }

    #[instrument(skip(self), fields(host))]
    fn record_rate_limit(&self, url: &str, delay: Duration) {
        let host = host_key(url);
        tracing::Span::current().record("host", host.as_str());
        self.record_rate_limit_at(&host, delay, Instant::now());
    }
}

/// Extracts the ledger key (scheme, host and port) from a URL.
///
/// Returns "unknown" for malformed or opaque URLs, ensuring all requests are still
/// rate limited even if the URL cannot be parsed.
///
/// # Examples
///
/// ```
/// use reqcache::fetch::host_key;
///
/// assert_eq!(host_key("https://example.com/path"), "https://example.com");
/// assert_eq!(host_key("http://Example.COM:8080/Path"), "http://example.com:8080");
/// assert_eq!(host_key("not a url"), "unknown");
/// ```
#[must_use]
pub fn host_key(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .map(|u| u.origin())
        .filter(url::Origin::is_tuple)
        .map_or_else(|| "unknown".to_string(), |origin| origin.ascii_serialization())
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
/// use reqcache::fetch::parse_retry_after;
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
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    match datetime.duration_since(std::time::SystemTime::now()) {
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
    }
}
