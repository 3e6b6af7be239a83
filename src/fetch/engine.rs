//! Retrieval engine: the orchestrator behind every fetch.
//!
//! For each call the engine merges its base descriptor with the call's descriptor,
//! derives the cache key, consults the [`CacheGateway`], and on a miss throttles, sends
//! (with retries), validates the status and hands back a [`StreamingReader`] that may be
//! teeing the body into the cache.
//!
//! An engine is cheap to clone; clones share the fetcher, throttle and cache store.
//! A single instance is meant to be driven from one thread at a time, independent
//! engines may run concurrently (and may share a throttle on purpose).
//!
//! # Example
//!
//! ```no_run
//! use reqcache::{FetchOptions, RequestDescriptor, RetrievalEngine, SourceConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = RetrievalEngine::builder()
//!     .base(RequestDescriptor::new("https://example.com/"))
//!     .config(SourceConfig::builder().requests_per_second(2.0).build()?)
//!     .cache_dir("./cache")
//!     .build()?;
//!
//! let mut reader = engine.fetch(&RequestDescriptor::new("feed.xml"), &FetchOptions::new())?;
//! let body = reader.read_all()?;
//! reader.finish()?;
//! println!("{} bytes", body.len());
//! # Ok(())
//! # }
//! ```

use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, instrument, warn};

use super::client::{FetchResponse, Fetcher, HttpFetcher};
use super::constants::is_transient_status;
use super::rate_limiter::{RateLimiter, Throttle, parse_retry_after};
use super::retry::{RetryDecision, RetryPolicy, classify_error, classify_status};
use super::{ErrorKind, FetchError};
use crate::cache::{
    Bypass, CacheGateway, CacheKey, CacheLookup, CacheStore, DEFAULT_CACHE_DIR, FetchOptions,
    FileCacheStore, StorePlan,
};
use crate::config::SourceConfig;
use crate::load::{Deferred, Loadable};
use crate::reader::StreamingReader;
use crate::request::RequestDescriptor;
use crate::user_agent::default_user_agent;

/// Cached, rate-limited retrieval of remote resources.
#[derive(Clone)]
pub struct RetrievalEngine {
    base: RequestDescriptor,
    config: SourceConfig,
    gateway: CacheGateway,
    throttle: Arc<dyn Throttle>,
    fetcher: Arc<dyn Fetcher>,
    retry: RetryPolicy,
}

impl fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("base", &self.base)
            .field("config", &self.config)
            .field("throttle", &self.throttle)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RetrievalEngine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Base descriptor merged under every request.
    #[must_use]
    pub fn base(&self) -> &RequestDescriptor {
        &self.base
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Effective request for `request`: the base descriptor merged with it.
    #[must_use]
    pub fn effective_request(&self, request: &RequestDescriptor) -> RequestDescriptor {
        self.base.merge(request)
    }

    /// Cache key the engine uses for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidUrl`] when the effective path is not an absolute URL.
    pub fn cache_key(&self, request: &RequestDescriptor) -> Result<CacheKey, FetchError> {
        CacheKey::for_request(&self.effective_request(request))
    }

    /// Opens a reader for `request`, from the cache when possible.
    ///
    /// A cache hit with stored metadata is status-checked again; a hit without metadata
    /// is trusted. On a miss the engine waits for the throttle, sends the request
    /// (retrying transient failures), checks the status and tees the body into the cache
    /// when storage applies. Call [`StreamingReader::finish`] to commit the cache entry;
    /// dropping the reader discards it.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Status`] when the status check fails (the body may still have
    ///   been stored when `store_failed_requests` is set)
    /// - [`FetchError::InvalidUrl`] for a relative or non-http effective path
    /// - transport errors, unchanged once retries are exhausted
    #[instrument(skip(self, request, options), fields(url))]
    pub fn fetch(
        &self,
        request: &RequestDescriptor,
        options: &FetchOptions,
    ) -> Result<StreamingReader, FetchError> {
        let effective = self.effective_request(request);
        tracing::Span::current().record("url", effective.path());
        let key = CacheKey::for_request(&effective)?;
        let chunk_size = self.config.chunk_size();

        if let CacheLookup::Hit(entry) = self.gateway.lookup(&key, &effective, options) {
            let reader = StreamingReader::cached(effective.path(), entry, chunk_size);
            if let Some(metadata) = reader.metadata() {
                self.config
                    .status_check()
                    .check(metadata.status, &metadata.url)?;
            }
            debug!(key = %key, "serving from cache");
            return Ok(reader);
        }

        let response = self.send(&effective)?;
        let (metadata, body) = response.into_parts();
        let mut reader = StreamingReader::live(body, metadata.clone(), chunk_size);
        reader = match self.gateway.plan_store(&key, &effective, &metadata, options) {
            StorePlan::Skip => reader,
            StorePlan::Store {
                writer,
                metadata: stored,
            } => reader.tee_into(key.to_string(), writer, stored),
            StorePlan::Failed => reader.store_failed(),
        };
        if self.config.store_failed_requests() {
            reader = reader.store_on_error([ErrorKind::Status]);
        }

        if let Err(err) = self.config.status_check().check(metadata.status, &metadata.url) {
            let outcome = reader.close_with_error(&err);
            debug!(status = metadata.status, ?outcome, "status check failed");
            return Err(err);
        }
        Ok(reader)
    }

    /// Fetches `request` straight from the network, bypassing the cache entirely.
    ///
    /// # Errors
    ///
    /// Same as [`RetrievalEngine::fetch`].
    pub fn fetch_uncached(&self, request: &RequestDescriptor) -> Result<StreamingReader, FetchError> {
        self.fetch(request, &FetchOptions::from(Bypass::Full))
    }

    /// Fetches `request` and loads it as `T`.
    ///
    /// The reader is finished (drained and committed to the cache) only when loading
    /// succeeds; a loader error discards the pending cache entry unless its kind is on the
    /// store-on-error allow-list.
    ///
    /// # Errors
    ///
    /// Errors of [`RetrievalEngine::fetch`], read errors while draining, and
    /// [`FetchError::Load`] wrapping the loader's error.
    pub fn load<T: Loadable>(
        &self,
        request: &RequestDescriptor,
        options: &FetchOptions,
    ) -> Result<T, FetchError> {
        let mut reader = self.fetch(request, options)?;
        match T::load(&mut reader, self.config.load_config()) {
            Ok(value) => {
                reader.finish()?;
                Ok(value)
            }
            Err(err) => {
                let err = into_fetch_error(err.into());
                reader.close_with_error(&err);
                Err(err)
            }
        }
    }

    /// Captures `request` for a later [`Deferred::open`] or [`Deferred::load`].
    #[must_use]
    pub fn deferred(&self, request: RequestDescriptor, options: FetchOptions) -> Deferred {
        Deferred::new(self.clone(), request, options)
    }

    /// Throttles once, then sends with retries.
    fn send(&self, request: &RequestDescriptor) -> Result<FetchResponse, FetchError> {
        let url = request.path();
        let waited = self.throttle.acquire(url);
        if !waited.is_zero() {
            debug!(url, waited_ms = waited.as_millis(), "throttled before send");
        }

        let mut attempt = 1;
        loop {
            let outcome = self.fetcher.get(request);
            let retryable = match &outcome {
                Ok(response) if is_transient_status(response.status) => Some((
                    classify_status(response.status),
                    response.header("retry-after").and_then(parse_retry_after),
                )),
                Ok(_) => None,
                Err(err) => Some((classify_error(err), None)),
            };
            let Some((failure, server_delay)) = retryable else {
                return outcome;
            };

            match self.retry.should_retry(failure, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    let delay = match server_delay {
                        Some(server_delay) => {
                            self.throttle.record_rate_limit(url, server_delay);
                            server_delay
                        }
                        None => delay,
                    };
                    match &outcome {
                        Ok(response) => warn!(
                            url,
                            attempt,
                            status = response.status,
                            delay_ms = delay.as_millis(),
                            "transient status, retrying"
                        ),
                        Err(err) => warn!(
                            url,
                            attempt,
                            error = %err,
                            delay_ms = delay.as_millis(),
                            "transient error, retrying"
                        ),
                    }
                    drop(outcome);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    if attempt > 1 {
                        info!(url, attempt, reason = %reason, "giving up after retries");
                    }
                    return outcome;
                }
            }
        }
    }
}

/// Unwraps loader errors that already are fetch errors (e.g. a truncated body).
fn into_fetch_error(err: Box<dyn Error + Send + Sync>) -> FetchError {
    match err.downcast::<FetchError>() {
        Ok(err) => *err,
        Err(err) => FetchError::Load(err),
    }
}

/// Builder for [`RetrievalEngine`].
///
/// Unset collaborators get defaults: an [`HttpFetcher`], a [`RateLimiter`] at the
/// configured rate and a [`FileCacheStore`] at [`DEFAULT_CACHE_DIR`].
#[derive(Default)]
#[must_use]
pub struct EngineBuilder {
    base: Option<RequestDescriptor>,
    config: Option<SourceConfig>,
    store: Option<Arc<dyn CacheStore>>,
    cache_dir: Option<PathBuf>,
    throttle: Option<Arc<dyn Throttle>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    retry: Option<RetryPolicy>,
    verify_tls: Option<bool>,
    require_fingerprint: Option<String>,
}

impl EngineBuilder {
    /// Base descriptor, merged on top of the default one (which carries the User-Agent).
    pub fn base(mut self, base: RequestDescriptor) -> Self {
        self.base = Some(base);
        self
    }

    /// Engine configuration.
    pub fn config(mut self, config: SourceConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Cache store; overrides [`EngineBuilder::cache_dir`].
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Root directory of the default file store.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Throttle, e.g. a [`RateLimiter`] shared with other engines.
    pub fn throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Network fetcher; overrides the TLS options below.
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Retry policy; defaults to the configured retry budget with standard backoff.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Whether the default fetcher verifies TLS certificates (default `true`).
    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = Some(verify);
        self
    }

    /// SHA-256 fingerprint the default fetcher pins HTTPS servers to.
    pub fn require_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.require_fingerprint = Some(fingerprint.into());
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Config`] for an invalid fingerprint or request rate.
    pub fn build(self) -> Result<RetrievalEngine, FetchError> {
        let config = self.config.unwrap_or_default();

        let default_base = RequestDescriptor::new("").with_header("User-Agent", default_user_agent());
        let base = match &self.base {
            Some(base) => default_base.merge(base),
            None => default_base,
        };

        let throttle: Arc<dyn Throttle> = match self.throttle {
            Some(throttle) => throttle,
            None => Arc::new(RateLimiter::from_requests_per_second(
                config.requests_per_second(),
            )?),
        };

        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => {
                let mut fetcher =
                    HttpFetcher::new(&config).verify_tls(self.verify_tls.unwrap_or(true));
                if let Some(fingerprint) = &self.require_fingerprint {
                    fetcher = fetcher.require_fingerprint(fingerprint)?;
                }
                Arc::new(fetcher)
            }
        };

        let store: Arc<dyn CacheStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FileCacheStore::new(
                self.cache_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR)),
            )),
        };

        let retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::with_max_retries(config.http_retries()));

        debug!(?base, ?retry, "retrieval engine built");
        Ok(RetrievalEngine {
            base,
            gateway: CacheGateway::new(store, &config),
            config,
            throttle,
            fetcher,
            retry,
        })
    }
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("base", &self.base)
            .field("config", &self.config)
            .field("cache_dir", &self.cache_dir)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
