//! Engine configuration.
//!
//! [`SourceConfig`] is immutable and always valid: both construction paths
//! ([`SourceConfig::builder`] and JSON deserialization) check option dependencies eagerly
//! and fail with [`ConfigError`] before any fetch happens.
//!
//! ```
//! use reqcache::{ConfigError, SourceConfig};
//!
//! let err = SourceConfig::builder()
//!     .store_to_cache(false)
//!     .build()
//!     .unwrap_err();
//! assert!(matches!(err, ConfigError::Dependency { option: "store_metadata", .. }));
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::fetch::StatusCheckMode;
use crate::fetch::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_CHUNK_SIZE, DEFAULT_REQUESTS_PER_SECOND, READ_TIMEOUT_SECS,
};
use crate::fetch::retry::DEFAULT_HTTP_RETRIES;
use crate::load::LoadConfig;

/// Invalid configuration, detected at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An option was enabled without the option it depends on.
    #[error("configuration option {option:?} requires {requires:?}")]
    Dependency {
        /// The enabled option.
        option: &'static str,
        /// The option it depends on.
        requires: &'static str,
    },

    /// An option has a value outside its domain.
    #[error("invalid value for configuration option {option:?}: {reason}")]
    InvalidValue {
        /// The offending option.
        option: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// A configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// The config file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration document is not valid JSON for [`SourceConfig`].
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid_value(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            option,
            reason: reason.into(),
        }
    }
}

/// Behavior of a retrieval engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawSourceConfig")]
pub struct SourceConfig {
    load_from_cache: bool,
    store_to_cache: bool,
    store_metadata: bool,
    store_failed_requests: bool,
    cache_response_codes: Option<BTreeSet<u16>>,
    status_check: StatusCheckMode,
    http_retries: u32,
    requests_per_second: f64,
    connect_timeout: Duration,
    timeout: Duration,
    chunk_size: usize,
    load_config: LoadConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            load_from_cache: true,
            store_to_cache: true,
            store_metadata: true,
            store_failed_requests: true,
            cache_response_codes: None,
            status_check: StatusCheckMode::default(),
            http_retries: DEFAULT_HTTP_RETRIES,
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            load_config: LoadConfig::default(),
        }
    }
}

impl SourceConfig {
    /// Starts a builder from the default configuration.
    #[must_use]
    pub fn builder() -> SourceConfigBuilder {
        SourceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Starts a builder from this configuration, e.g. to override file values.
    #[must_use]
    pub fn to_builder(&self) -> SourceConfigBuilder {
        SourceConfigBuilder {
            config: self.clone(),
        }
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// Missing keys take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and the validation errors of
    /// [`SourceConfigBuilder::build`] otherwise.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let raw: RawSourceConfig = serde_json::from_str(raw)?;
        Self::try_from(raw)
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, otherwise the errors of
    /// [`SourceConfig::from_json_str`].
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Whether cached entries are consulted before the network.
    #[must_use]
    pub fn load_from_cache(&self) -> bool {
        self.load_from_cache
    }

    /// Whether live responses are written to the cache.
    #[must_use]
    pub fn store_to_cache(&self) -> bool {
        self.store_to_cache
    }

    /// Whether response metadata is stored next to cached bodies.
    #[must_use]
    pub fn store_metadata(&self) -> bool {
        self.store_metadata
    }

    /// Whether responses failing the status check are still promoted into the cache.
    #[must_use]
    pub fn store_failed_requests(&self) -> bool {
        self.store_failed_requests
    }

    /// Status codes eligible for storage; `None` allows every code.
    #[must_use]
    pub fn cache_response_codes(&self) -> Option<&BTreeSet<u16>> {
        self.cache_response_codes.as_ref()
    }

    /// Status check strictness.
    #[must_use]
    pub fn status_check(&self) -> StatusCheckMode {
        self.status_check
    }

    /// Retry budget for transient failures.
    #[must_use]
    pub fn http_retries(&self) -> u32 {
        self.http_retries
    }

    /// Per-origin request rate; infinite disables throttling.
    #[must_use]
    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second
    }

    /// Connect timeout for network fetches.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Total request timeout for network fetches.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Chunk size used when draining or chunk-reading bodies.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Opaque configuration handed to typed loaders.
    #[must_use]
    pub fn load_config(&self) -> &LoadConfig {
        &self.load_config
    }

    fn validate(self) -> Result<Self, ConfigError> {
        let dependencies = [
            ("store_metadata", self.store_metadata, "store_to_cache", self.store_to_cache),
            (
                "store_failed_requests",
                self.store_failed_requests,
                "store_metadata",
                self.store_metadata,
            ),
        ];
        for (option, enabled, requires, dependency_enabled) in dependencies {
            if enabled && !dependency_enabled {
                return Err(ConfigError::Dependency { option, requires });
            }
        }

        if self.requests_per_second.is_nan() || self.requests_per_second <= 0.0 {
            return Err(ConfigError::invalid_value(
                "requests_per_second",
                format!("{} is not strictly positive", self.requests_per_second),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::invalid_value("chunk_size", "must be non-zero"));
        }
        if self.timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(ConfigError::invalid_value("timeout", "must be non-zero"));
        }
        Ok(self)
    }
}

/// Builder for [`SourceConfig`].
#[derive(Debug, Clone)]
#[must_use]
pub struct SourceConfigBuilder {
    config: SourceConfig,
}

impl SourceConfigBuilder {
    /// Consult cached entries before the network.
    pub fn load_from_cache(mut self, enabled: bool) -> Self {
        self.config.load_from_cache = enabled;
        self
    }

    /// Write live responses to the cache.
    pub fn store_to_cache(mut self, enabled: bool) -> Self {
        self.config.store_to_cache = enabled;
        self
    }

    /// Store response metadata next to cached bodies. Requires `store_to_cache`.
    pub fn store_metadata(mut self, enabled: bool) -> Self {
        self.config.store_metadata = enabled;
        self
    }

    /// Promote responses failing the status check. Requires `store_metadata`.
    pub fn store_failed_requests(mut self, enabled: bool) -> Self {
        self.config.store_failed_requests = enabled;
        self
    }

    /// Disables every cache interaction (and the options depending on it).
    pub fn disable_cache(self) -> Self {
        self.load_from_cache(false)
            .store_to_cache(false)
            .store_metadata(false)
            .store_failed_requests(false)
    }

    /// Restricts storage to the given status codes.
    pub fn cache_response_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.config.cache_response_codes = Some(codes.into_iter().collect());
        self
    }

    /// Status check strictness.
    pub fn status_check(mut self, mode: StatusCheckMode) -> Self {
        self.config.status_check = mode;
        self
    }

    /// Retry budget for transient failures.
    pub fn http_retries(mut self, retries: u32) -> Self {
        self.config.http_retries = retries;
        self
    }

    /// Per-origin request rate; `f64::INFINITY` disables throttling.
    pub fn requests_per_second(mut self, rate: f64) -> Self {
        self.config.requests_per_second = rate;
        self
    }

    /// Connect timeout for network fetches.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Total request timeout for network fetches.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Chunk size used when draining or chunk-reading bodies.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Configuration handed to typed loaders.
    pub fn load_config(mut self, config: LoadConfig) -> Self {
        self.config.load_config = config;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Dependency`] when `store_metadata` is enabled without
    /// `store_to_cache`, or `store_failed_requests` without `store_metadata`, and
    /// [`ConfigError::InvalidValue`] for a non-positive request rate, a zero chunk size
    /// or a zero timeout.
    pub fn build(self) -> Result<SourceConfig, ConfigError> {
        self.config.validate()
    }
}

/// Request rate as written in config files: a number or `"unlimited"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawRate {
    PerSecond(f64),
    Label(String),
}

/// On-disk shape of [`SourceConfig`].
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawSourceConfig {
    load_from_cache: bool,
    store_to_cache: bool,
    store_metadata: bool,
    store_failed_requests: bool,
    cache_response_codes: Option<BTreeSet<u16>>,
    status_check: StatusCheckMode,
    http_retries: u32,
    requests_per_second: RawRate,
    connect_timeout_secs: u64,
    timeout_secs: u64,
    chunk_size: usize,
    load_config: LoadConfig,
}

impl Default for RawSourceConfig {
    fn default() -> Self {
        let defaults = SourceConfig::default();
        Self {
            load_from_cache: defaults.load_from_cache,
            store_to_cache: defaults.store_to_cache,
            store_metadata: defaults.store_metadata,
            store_failed_requests: defaults.store_failed_requests,
            cache_response_codes: defaults.cache_response_codes,
            status_check: defaults.status_check,
            http_retries: defaults.http_retries,
            requests_per_second: RawRate::PerSecond(defaults.requests_per_second),
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
            timeout_secs: defaults.timeout.as_secs(),
            chunk_size: defaults.chunk_size,
            load_config: defaults.load_config,
        }
    }
}

impl TryFrom<RawSourceConfig> for SourceConfig {
    type Error = ConfigError;

    fn try_from(raw: RawSourceConfig) -> Result<Self, Self::Error> {
        let requests_per_second = match raw.requests_per_second {
            RawRate::PerSecond(rate) => rate,
            RawRate::Label(label)
                if label.eq_ignore_ascii_case("unlimited") || label.eq_ignore_ascii_case("inf") =>
            {
                f64::INFINITY
            }
            RawRate::Label(label) => {
                return Err(ConfigError::invalid_value(
                    "requests_per_second",
                    format!("unknown rate {label:?}"),
                ));
            }
        };

        SourceConfig {
            load_from_cache: raw.load_from_cache,
            store_to_cache: raw.store_to_cache,
            store_metadata: raw.store_metadata,
            store_failed_requests: raw.store_failed_requests,
            cache_response_codes: raw.cache_response_codes,
            status_check: raw.status_check,
            http_retries: raw.http_retries,
            requests_per_second,
            connect_timeout: Duration::from_secs(raw.connect_timeout_secs),
            timeout: Duration::from_secs(raw.timeout_secs),
            chunk_size: raw.chunk_size,
            load_config: raw.load_config,
        }
        .validate()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SourceConfig::builder().build().unwrap();
        assert_eq!(config, SourceConfig::default());
        assert!(config.load_from_cache());
        assert!(config.store_to_cache());
        assert!(config.store_metadata());
        assert!(config.store_failed_requests());
        assert_eq!(config.status_check(), StatusCheckMode::Require200);
        assert_eq!(config.http_retries(), 3);
        assert!((config.requests_per_second() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_store_metadata_requires_store_to_cache() {
        let err = SourceConfig::builder()
            .store_to_cache(false)
            .store_failed_requests(false)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Dependency {
                option: "store_metadata",
                requires: "store_to_cache"
            }
        ));
    }

    #[test]
    fn test_store_failed_requests_requires_store_metadata() {
        let err = SourceConfig::builder()
            .store_metadata(false)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Dependency {
                option: "store_failed_requests",
                requires: "store_metadata"
            }
        ));
        assert!(err.to_string().contains("requires"));
    }

    #[test]
    fn test_disable_cache_is_consistent() {
        let config = SourceConfig::builder().disable_cache().build().unwrap();
        assert!(!config.load_from_cache());
        assert!(!config.store_to_cache());
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        for rate in [0.0, -1.0, f64::NAN] {
            let err = SourceConfig::builder()
                .requests_per_second(rate)
                .build()
                .unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue {
                    option: "requests_per_second",
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_accepts_infinite_rate() {
        let config = SourceConfig::builder()
            .requests_per_second(f64::INFINITY)
            .build()
            .unwrap();
        assert!(config.requests_per_second().is_infinite());
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        assert!(SourceConfig::builder().chunk_size(0).build().is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = SourceConfig::from_json_str(
            r#"{"status_check": "check_error", "http_retries": 7, "cache_response_codes": [200, 418]}"#,
        )
        .unwrap();
        assert_eq!(config.status_check(), StatusCheckMode::CheckError);
        assert_eq!(config.http_retries(), 7);
        assert_eq!(
            config.cache_response_codes().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![200, 418]
        );
        assert!(config.load_from_cache());
        assert_eq!(config.timeout(), Duration::from_secs(READ_TIMEOUT_SECS));
    }

    #[test]
    fn test_from_json_unlimited_rate() {
        let config = SourceConfig::from_json_str(r#"{"requests_per_second": "unlimited"}"#).unwrap();
        assert!(config.requests_per_second().is_infinite());

        let err = SourceConfig::from_json_str(r#"{"requests_per_second": "fast"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_from_json_validates_dependencies() {
        let err = SourceConfig::from_json_str(r#"{"store_to_cache": false}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Dependency { .. }));
    }

    #[test]
    fn test_from_json_rejects_unknown_keys() {
        let err = SourceConfig::from_json_str(r#"{"enable_turbo": true}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_deserialize_goes_through_validation() {
        let result: Result<SourceConfig, _> =
            serde_json::from_str(r#"{"store_metadata": false}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_json_file_missing() {
        let err = SourceConfig::from_json_file(Path::new("/nonexistent/reqcache.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_to_builder_keeps_file_values() {
        let base = SourceConfig::from_json_str(r#"{"http_retries": 9}"#).unwrap();
        let config = base.to_builder().load_from_cache(false).build().unwrap();
        assert_eq!(config.http_retries(), 9);
        assert!(!config.load_from_cache());
        assert!(base.load_from_cache());
    }
}
