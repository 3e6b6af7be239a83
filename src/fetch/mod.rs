//! Cached, rate-limited retrieval.
//!
//! This module provides the [`RetrievalEngine`] and the collaborators it composes:
//! a [`Fetcher`] for the network, a [`Throttle`] for per-host spacing and a
//! [`RetryPolicy`] for transient failures.
//!
//! # Features
//!
//! - Cache lookup before the network, with per-call bypass rules
//! - Per-origin rate limiting shared across callers
//! - Bounded retries with exponential backoff for 420, 429 and 500-519, honoring Retry-After
//! - No redirect following; redirects are surfaced to the caller
//! - Status validation ([`StatusCheckMode`]) with typed errors
//! - Streaming bodies teed into the cache while the caller reads
//!
//! # Example
//!
//! ```no_run
//! use reqcache::fetch::RetrievalEngine;
//! use reqcache::{Bypass, FetchOptions, RequestDescriptor};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = RetrievalEngine::builder().build()?;
//! let request = RequestDescriptor::new("https://example.com/titles.xml");
//!
//! // Always go to the network, but refresh the cached copy.
//! let mut reader = engine.fetch(&request, &FetchOptions::from(Bypass::ReadOnly))?;
//! let body = reader.read_all()?;
//! reader.finish()?;
//! println!("{} bytes", body.len());
//! # Ok(())
//! # }
//! ```

mod client;
pub(crate) mod constants;
mod engine;
mod error;
mod pinning;
pub mod rate_limiter;
pub(crate) mod retry;
mod status;

pub use client::{FetchResponse, Fetcher, HttpFetcher, request_url};
pub use engine::{EngineBuilder, RetrievalEngine};
pub use error::{CacheWriteError, ErrorKind, FetchError, ReaderError};
pub use rate_limiter::{RateLimiter, Throttle, host_key, parse_retry_after};
pub use retry::{
    DEFAULT_HTTP_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error, classify_status,
};
pub use status::StatusCheckMode;
