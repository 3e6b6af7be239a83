//! Reqcache Library
//!
//! Fetches remote resources through an on-disk cache with per-host rate limiting.
//! Callers describe a request once ([`RequestDescriptor`]), hand it to a
//! [`RetrievalEngine`] and read the body from a [`StreamingReader`] that tees it into
//! the cache as it is consumed.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`request`] - Request descriptors and merging
//! - [`cache`] - Cache keys, stores, metadata sidecars and bypass rules
//! - [`fetch`] - Retrieval engine, HTTP transport, rate limiting, retries, status checks
//! - [`reader`] - Streaming reader with write-through to the cache
//! - [`load`] - Typed loading of bodies
//! - [`config`] - Engine configuration
//!
//! # Example
//!
//! ```no_run
//! use reqcache::{Bypass, FetchOptions, RequestDescriptor, RetrievalEngine};
//!
//! # fn example() -> Result<(), reqcache::FetchError> {
//! let engine = RetrievalEngine::builder()
//!     .base(RequestDescriptor::new("https://example.com/data/").with_param("lang", "en"))
//!     .build()?;
//!
//! let text: String = engine.load(&RequestDescriptor::new("index.txt"), &FetchOptions::new())?;
//! let fresh: Vec<u8> = engine.load(
//!     &RequestDescriptor::new("index.txt"),
//!     &FetchOptions::from(Bypass::ReadOnly),
//! )?;
//! assert_eq!(text.len(), fresh.len());
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod fetch;
pub mod load;
pub mod reader;
pub mod request;
mod user_agent;

// Re-export commonly used types
pub use cache::{
    Bypass, BypassRule, CacheKey, CacheStore, DEFAULT_CACHE_DIR, FetchOptions, FileCacheStore,
    MemoryCacheStore, ResponseMetadata,
};
pub use config::{ConfigError, SourceConfig, SourceConfigBuilder};
pub use fetch::{
    EngineBuilder, ErrorKind, FetchError, RateLimiter, ReaderError, RetrievalEngine,
    StatusCheckMode,
};
pub use load::{Deferred, Json, LoadConfig, Loadable};
pub use reader::{CacheOutcome, StreamingReader};
pub use request::{ClientCert, RequestDescriptor, RequestMap, Scalar};
pub use user_agent::default_user_agent;
