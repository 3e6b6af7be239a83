//! Cache gateway: turns bypass flags and configuration into store reads and writes.
//!
//! A fetch carries three independent bypass rules:
//!
//! | rule | effect |
//! |------|--------|
//! | `skip_cache` | no cache read, no cache write |
//! | `skip_cache_read` | the stored entry is ignored for this call; the live response may still be stored |
//! | `skip_cache_write` | the live response is never stored |
//!
//! Rules are evaluated per call against the outgoing request or the received response.
//! The key itself is never altered by a rule, so other callers keep addressing the same
//! entry.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{CacheEntry, CacheKey, CacheStore, CacheWriter, ResponseMetadata};
use crate::config::SourceConfig;
use crate::request::RequestDescriptor;

/// Preset combinations of bypass rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Bypass {
    /// Read from and write to the cache.
    #[default]
    None,
    /// Skip only the cache read: always fetch live, still store the result.
    ReadOnly,
    /// Skip only the cache write: serve hits, never store.
    WriteOnly,
    /// Skip the cache entirely.
    Full,
}

type RequestPredicate = Arc<dyn Fn(&RequestDescriptor) -> bool + Send + Sync>;
type ResponsePredicate = Arc<dyn Fn(&ResponseMetadata) -> bool + Send + Sync>;

/// A bypass flag: constant or a predicate evaluated lazily.
#[derive(Clone, Default)]
pub enum BypassRule {
    /// Never bypass.
    #[default]
    Never,
    /// Always bypass.
    Always,
    /// Bypass when the predicate holds for the effective request.
    Request(RequestPredicate),
    /// Bypass when the predicate holds for the live response. Only consulted when a
    /// response exists, so it never suppresses a cache read.
    Response(ResponsePredicate),
}

impl BypassRule {
    /// Rule backed by a request predicate.
    pub fn request(predicate: impl Fn(&RequestDescriptor) -> bool + Send + Sync + 'static) -> Self {
        Self::Request(Arc::new(predicate))
    }

    /// Rule backed by a response predicate.
    pub fn response(predicate: impl Fn(&ResponseMetadata) -> bool + Send + Sync + 'static) -> Self {
        Self::Response(Arc::new(predicate))
    }

    fn applies_before_fetch(&self, request: &RequestDescriptor) -> bool {
        match self {
            Self::Never | Self::Response(_) => false,
            Self::Always => true,
            Self::Request(predicate) => predicate(request),
        }
    }

    fn applies_after_fetch(&self, request: &RequestDescriptor, response: &ResponseMetadata) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Request(predicate) => predicate(request),
            Self::Response(predicate) => predicate(response),
        }
    }
}

impl From<bool> for BypassRule {
    fn from(value: bool) -> Self {
        if value { Self::Always } else { Self::Never }
    }
}

impl fmt::Debug for BypassRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::Request(_) => f.write_str("Request(..)"),
            Self::Response(_) => f.write_str("Response(..)"),
        }
    }
}

/// Per-call cache behavior.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Skip the cache for both read and write.
    pub skip_cache: BypassRule,
    /// Ignore a stored entry for this call.
    pub skip_cache_read: BypassRule,
    /// Do not store the live response.
    pub skip_cache_write: BypassRule,
}

impl FetchOptions {
    /// Options that bypass nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the skip-entirely rule.
    #[must_use]
    pub fn skip_cache(mut self, rule: impl Into<BypassRule>) -> Self {
        self.skip_cache = rule.into();
        self
    }

    /// Replaces the skip-read rule.
    #[must_use]
    pub fn skip_cache_read(mut self, rule: impl Into<BypassRule>) -> Self {
        self.skip_cache_read = rule.into();
        self
    }

    /// Replaces the skip-write rule.
    #[must_use]
    pub fn skip_cache_write(mut self, rule: impl Into<BypassRule>) -> Self {
        self.skip_cache_write = rule.into();
        self
    }
}

impl From<Bypass> for FetchOptions {
    fn from(bypass: Bypass) -> Self {
        let options = Self::new();
        match bypass {
            Bypass::None => options,
            Bypass::ReadOnly => options.skip_cache_read(true),
            Bypass::WriteOnly => options.skip_cache_write(true),
            Bypass::Full => options.skip_cache(true),
        }
    }
}

/// Result of a gateway lookup.
#[derive(Debug)]
pub enum CacheLookup {
    /// A stored entry for the key.
    Hit(CacheEntry),
    /// No usable entry, or the read was bypassed.
    Miss,
}

/// Result of asking the gateway to store a live response.
pub enum StorePlan {
    /// Storage is disabled, bypassed, or the status is not storable.
    Skip,
    /// Tee the body into this writer and commit it with the given metadata.
    Store {
        /// Pending entry.
        writer: Box<dyn CacheWriter>,
        /// Metadata to commit alongside the body, if metadata storage is enabled.
        metadata: Option<ResponseMetadata>,
    },
    /// The store rejected the write; the fetch proceeds uncached.
    Failed,
}

impl fmt::Debug for StorePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => f.write_str("Skip"),
            Self::Store { metadata, .. } => f
                .debug_struct("Store")
                .field("metadata", metadata)
                .finish_non_exhaustive(),
            Self::Failed => f.write_str("Failed"),
        }
    }
}

/// Mediates every cache interaction of an engine.
#[derive(Debug, Clone)]
pub struct CacheGateway {
    store: Arc<dyn CacheStore>,
    load_from_cache: bool,
    store_to_cache: bool,
    store_metadata: bool,
    storable_codes: Option<BTreeSet<u16>>,
}

impl CacheGateway {
    /// Creates a gateway applying `config` to `store`.
    pub fn new(store: Arc<dyn CacheStore>, config: &SourceConfig) -> Self {
        Self {
            store,
            load_from_cache: config.load_from_cache(),
            store_to_cache: config.store_to_cache(),
            store_metadata: config.store_metadata(),
            storable_codes: config.cache_response_codes().cloned(),
        }
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Looks up `key` unless reading is disabled or bypassed for `request`.
    ///
    /// Store read errors are logged and reported as a miss.
    #[must_use]
    pub fn lookup(
        &self,
        key: &CacheKey,
        request: &RequestDescriptor,
        options: &FetchOptions,
    ) -> CacheLookup {
        if !self.load_from_cache
            || options.skip_cache.applies_before_fetch(request)
            || options.skip_cache_read.applies_before_fetch(request)
        {
            debug!(key = %key, "cache read bypassed");
            return CacheLookup::Miss;
        }

        match self.store.get(key) {
            Ok(Some(entry)) => {
                debug!(key = %key, size = entry.size, "cache hit");
                CacheLookup::Hit(entry)
            }
            Ok(None) => {
                debug!(key = %key, "cache miss");
                CacheLookup::Miss
            }
            Err(err) => {
                warn!(key = %key, error = %err, "cache read failed, treating as miss");
                CacheLookup::Miss
            }
        }
    }

    /// Whether a response with `status` may be stored at all.
    #[must_use]
    pub fn is_storable(&self, status: u16) -> bool {
        self.storable_codes
            .as_ref()
            .is_none_or(|codes| codes.contains(&status))
    }

    /// Decides whether the live `response` for `request` is stored, and opens the writer.
    ///
    /// A store that rejects the write yields [`StorePlan::Failed`] and a warning; the
    /// fetch itself is unaffected.
    #[must_use]
    pub fn plan_store(
        &self,
        key: &CacheKey,
        request: &RequestDescriptor,
        response: &ResponseMetadata,
        options: &FetchOptions,
    ) -> StorePlan {
        if !self.store_to_cache
            || options.skip_cache.applies_after_fetch(request, response)
            || options.skip_cache_write.applies_after_fetch(request, response)
        {
            debug!(key = %key, "cache write bypassed");
            return StorePlan::Skip;
        }
        if !self.is_storable(response.status) {
            debug!(key = %key, status = response.status, "status not storable");
            return StorePlan::Skip;
        }

        match self.store.begin_write(key) {
            Ok(writer) => StorePlan::Store {
                writer,
                metadata: self.store_metadata.then(|| response.clone()),
            },
            Err(err) => {
                warn!(key = %key, error = %err, "cache write failed, continuing uncached");
                StorePlan::Failed
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::time::Duration;

    use super::*;
    use crate::cache::MemoryCacheStore;

    fn request() -> RequestDescriptor {
        RequestDescriptor::new("http://test/a/b")
    }

    fn response(status: u16) -> ResponseMetadata {
        ResponseMetadata::capture(
            "http://test/a/b",
            "HTTP/1.1",
            status,
            "",
            BTreeMap::new(),
            Duration::ZERO,
        )
    }

    fn gateway(store: &MemoryCacheStore, config: &SourceConfig) -> (CacheGateway, CacheKey) {
        let key = CacheKey::for_request(&request()).unwrap();
        (CacheGateway::new(Arc::new(store.clone()), config), key)
    }

    fn seed(store: &MemoryCacheStore, key: &CacheKey) {
        let mut writer = store.begin_write(key).unwrap();
        writer.write_all(b"cached").unwrap();
        writer.commit(None).unwrap();
    }

    #[test]
    fn test_lookup_hit_and_miss() {
        let store = MemoryCacheStore::new();
        let (gateway, key) = gateway(&store, &SourceConfig::default());
        let options = FetchOptions::new();
        assert!(matches!(gateway.lookup(&key, &request(), &options), CacheLookup::Miss));
        seed(&store, &key);
        assert!(matches!(gateway.lookup(&key, &request(), &options), CacheLookup::Hit(_)));
    }

    #[test]
    fn test_read_bypass_presets() {
        let store = MemoryCacheStore::new();
        let (gateway, key) = gateway(&store, &SourceConfig::default());
        seed(&store, &key);

        for (bypass, hit) in [
            (Bypass::None, true),
            (Bypass::ReadOnly, false),
            (Bypass::WriteOnly, true),
            (Bypass::Full, false),
        ] {
            let lookup = gateway.lookup(&key, &request(), &FetchOptions::from(bypass));
            assert_eq!(matches!(lookup, CacheLookup::Hit(_)), hit, "{bypass:?}");
        }
    }

    #[test]
    fn test_write_bypass_presets() {
        let store = MemoryCacheStore::new();
        let (gateway, key) = gateway(&store, &SourceConfig::default());

        for (bypass, stored) in [
            (Bypass::None, true),
            (Bypass::ReadOnly, true),
            (Bypass::WriteOnly, false),
            (Bypass::Full, false),
        ] {
            let plan = gateway.plan_store(&key, &request(), &response(200), &FetchOptions::from(bypass));
            assert_eq!(matches!(plan, StorePlan::Store { .. }), stored, "{bypass:?}");
        }
    }

    #[test]
    fn test_response_predicate_only_affects_writes() {
        let store = MemoryCacheStore::new();
        let (gateway, key) = gateway(&store, &SourceConfig::default());
        seed(&store, &key);
        let options = FetchOptions::new().skip_cache(BypassRule::response(|meta| meta.status >= 500));

        assert!(matches!(gateway.lookup(&key, &request(), &options), CacheLookup::Hit(_)));
        assert!(matches!(
            gateway.plan_store(&key, &request(), &response(503), &options),
            StorePlan::Skip
        ));
        assert!(matches!(
            gateway.plan_store(&key, &request(), &response(200), &options),
            StorePlan::Store { .. }
        ));
    }

    #[test]
    fn test_request_predicate() {
        let store = MemoryCacheStore::new();
        let (gateway, key) = gateway(&store, &SourceConfig::default());
        seed(&store, &key);
        let options = FetchOptions::new()
            .skip_cache_read(BypassRule::request(|req| req.path().ends_with("/b")));
        assert!(matches!(gateway.lookup(&key, &request(), &options), CacheLookup::Miss));
    }

    #[test]
    fn test_storable_codes() {
        let store = MemoryCacheStore::new();
        let config = SourceConfig::builder().cache_response_codes([200, 404]).build().unwrap();
        let (gateway, key) = gateway(&store, &config);
        let options = FetchOptions::new();

        assert!(gateway.is_storable(404));
        assert!(!gateway.is_storable(500));
        assert!(matches!(
            gateway.plan_store(&key, &request(), &response(500), &options),
            StorePlan::Skip
        ));
    }

    #[test]
    fn test_any_code_storable_by_default() {
        let store = MemoryCacheStore::new();
        let (gateway, _) = gateway(&store, &SourceConfig::default());
        assert!(gateway.is_storable(500));
    }

    #[test]
    fn test_metadata_withheld_when_disabled() {
        let store = MemoryCacheStore::new();
        let config = SourceConfig::builder()
            .store_metadata(false)
            .store_failed_requests(false)
            .build()
            .unwrap();
        let (gateway, key) = gateway(&store, &config);

        match gateway.plan_store(&key, &request(), &response(200), &FetchOptions::new()) {
            StorePlan::Store { metadata, .. } => assert!(metadata.is_none()),
            other => panic!("expected Store, got {other:?}"),
        }
    }

    #[test]
    fn test_disabled_cache_never_reads_or_writes() {
        let store = MemoryCacheStore::new();
        let config = SourceConfig::builder().disable_cache().build().unwrap();
        let (gateway, key) = gateway(&store, &config);
        seed(&store, &key);
        let options = FetchOptions::new();

        assert!(matches!(gateway.lookup(&key, &request(), &options), CacheLookup::Miss));
        assert!(matches!(
            gateway.plan_store(&key, &request(), &response(200), &options),
            StorePlan::Skip
        ));
    }
}
