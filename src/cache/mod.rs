//! Response caching.
//!
//! - [`CacheKey`] derives a stable, path-safe key from an effective request
//! - [`CacheStore`] persists bodies plus [`ResponseMetadata`]; [`FileCacheStore`] on disk,
//!   [`MemoryCacheStore`] in process
//! - [`CacheGateway`] applies configuration and per-call [`FetchOptions`] to a store
//!
//! An entry is complete when its body is visible. Metadata is written first, so a visible
//! body with metadata always has the metadata of the same response (or of an older one if
//! the last write was interrupted between the two steps). A body without metadata is
//! trusted as previously validated.

mod gateway;
mod key;
mod metadata;
mod store;

pub use gateway::{Bypass, BypassRule, CacheGateway, CacheLookup, FetchOptions, StorePlan};
pub use key::{CacheKey, MAX_NAME_LEN};
pub use metadata::ResponseMetadata;
pub use store::{
    CacheEntry, CacheStore, CacheWriter, FileCacheStore, METADATA_SUFFIX, MemoryCacheStore,
    TEMP_SUFFIX,
};

/// Default cache root, relative to the working directory.
pub const DEFAULT_CACHE_DIR: &str = "./cache";
