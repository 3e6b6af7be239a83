//! Error types for the fetch module.
//!
//! This module defines structured errors for every stage of a retrieval: status
//! validation, transport, body reading, and configuration. Cache write failures have
//! their own type because they never abort a fetch.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced to callers of the retrieval engine.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Response failed the configured status check.
    #[error("got status code {status} for url {url}")]
    Status {
        /// The URL whose response was rejected.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Stream preconditions were violated while reading a body.
    #[error("reader error for {url}: {source}")]
    Reader {
        /// The URL whose body was being read.
        url: String,
        /// What went wrong.
        #[source]
        source: ReaderError,
    },

    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before a response arrived.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// I/O error while reading a response body.
    #[error("error reading body of {url}: {source}")]
    Read {
        /// The URL whose body failed.
        url: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Local file system error (client certificate files, output files).
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The request path is not an absolute http(s) URL after merging.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The server certificate did not match the pinned fingerprint.
    #[error("certificate fingerprint mismatch for {url}: expected {expected}, got {actual}")]
    Fingerprint {
        /// The URL whose connection was rejected.
        url: String,
        /// Pinned SHA-256 fingerprint (lowercase hex).
        expected: String,
        /// Fingerprint presented by the server, or `none`.
        actual: String,
    },

    /// TLS settings could not be assembled (pinned verifier, client certificate).
    #[error("TLS setup failed for {url}: {source}")]
    Tls {
        /// The URL the client was being built for.
        url: String,
        /// What went wrong.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error raised by a typed loader; propagated without inspection.
    #[error("load error: {0}")]
    Load(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Fieldless discriminant of [`FetchError`], used for store-on-error allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// [`FetchError::Status`]
    Status,
    /// [`FetchError::Reader`]
    Reader,
    /// [`FetchError::Network`]
    Network,
    /// [`FetchError::Timeout`]
    Timeout,
    /// [`FetchError::Read`]
    Read,
    /// [`FetchError::Io`]
    Io,
    /// [`FetchError::InvalidUrl`]
    InvalidUrl,
    /// [`FetchError::Fingerprint`]
    Fingerprint,
    /// [`FetchError::Tls`]
    Tls,
    /// [`FetchError::Config`]
    Config,
    /// [`FetchError::Load`]
    Load,
}

impl FetchError {
    /// Creates a status error.
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        Self::Status {
            url: url.into(),
            status,
        }
    }

    /// Creates a reader error.
    pub fn reader(url: impl Into<String>, source: ReaderError) -> Self {
        Self::Reader {
            url: url.into(),
            source,
        }
    }

    /// Creates a network error from a reqwest error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { url: url.into() }
        } else {
            Self::Network {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a body read error.
    pub fn read(url: impl Into<String>, source: std::io::Error) -> Self {
        Self::Read {
            url: url.into(),
            source,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a TLS setup error.
    pub fn tls(
        url: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Tls {
            url: url.into(),
            source: source.into(),
        }
    }

    /// Wraps an error returned by a typed loader.
    pub fn load(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Load(source.into())
    }

    /// Returns the discriminant of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Status { .. } => ErrorKind::Status,
            Self::Reader { .. } => ErrorKind::Reader,
            Self::Network { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Read { .. } => ErrorKind::Read,
            Self::Io { .. } => ErrorKind::Io,
            Self::InvalidUrl { .. } => ErrorKind::InvalidUrl,
            Self::Fingerprint { .. } => ErrorKind::Fingerprint,
            Self::Tls { .. } => ErrorKind::Tls,
            Self::Config(_) => ErrorKind::Config,
            Self::Load(_) => ErrorKind::Load,
        }
    }

    /// Returns the HTTP status code for status errors.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Violated stream preconditions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReaderError {
    /// The reader was closed and its connection released.
    #[error("reader is closed")]
    Closed,

    /// The body ended before the advertised Content-Length.
    #[error("body truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Advertised size in bytes.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },
}

/// A cache store rejected a write. Never fatal to the read path.
#[derive(Debug, Error)]
#[error("failed to write cache entry {key}: {source}")]
pub struct CacheWriteError {
    /// Canonical key of the entry.
    pub key: String,
    /// The underlying IO error.
    #[source]
    pub source: std::io::Error,
}

impl CacheWriteError {
    /// Creates a cache write error for `key`.
    pub fn new(key: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            key: key.into(),
            source,
        }
    }
}
