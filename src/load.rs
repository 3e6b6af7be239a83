//! Typed loading of response bodies.
//!
//! A [`Loadable`] type turns an open [`StreamingReader`] into a value. The engine passes
//! it the reader and the opaque [`LoadConfig`] from its configuration, then finishes the
//! reader (committing any pending cache entry) only if loading succeeded. Loader errors
//! are wrapped in [`FetchError::Load`] without inspection.
//!
//! ```no_run
//! use reqcache::{FetchOptions, Json, RequestDescriptor, RetrievalEngine};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = RetrievalEngine::builder()
//!     .base(RequestDescriptor::new("https://example.com/api/"))
//!     .build()?;
//! let Json(titles): Json<Vec<String>> =
//!     engine.load(&RequestDescriptor::new("titles.json"), &FetchOptions::new())?;
//! println!("{} titles", titles.len());
//! # Ok(())
//! # }
//! ```

use std::error::Error;
use std::io::Read;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::FetchOptions;
use crate::fetch::{FetchError, RetrievalEngine};
use crate::reader::StreamingReader;
use crate::request::RequestDescriptor;

/// Configuration handed through to loaders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Whether loaders should verify embedded checksums.
    pub verify_checksums: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            verify_checksums: true,
        }
    }
}

/// A value that can be loaded from a response body.
pub trait Loadable: Sized {
    /// Loader-specific error.
    type Error: Into<Box<dyn Error + Send + Sync>>;

    /// Reads `reader` (fully or partially) and builds the value.
    ///
    /// # Errors
    ///
    /// Returns the loader's own error for malformed or unreadable payloads.
    fn load(reader: &mut StreamingReader, config: &LoadConfig) -> Result<Self, Self::Error>;
}

impl Loadable for Vec<u8> {
    type Error = FetchError;

    fn load(reader: &mut StreamingReader, _config: &LoadConfig) -> Result<Self, Self::Error> {
        reader.read_all()
    }
}

impl Loadable for String {
    type Error = Box<dyn Error + Send + Sync>;

    fn load(reader: &mut StreamingReader, _config: &LoadConfig) -> Result<Self, Self::Error> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Ok(text)
    }
}

/// JSON payload deserialized with serde.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> Loadable for Json<T> {
    type Error = serde_json::Error;

    fn load(reader: &mut StreamingReader, _config: &LoadConfig) -> Result<Self, Self::Error> {
        serde_json::from_reader(reader).map(Json)
    }
}

/// A fetch captured for later: engine, request and options.
#[derive(Debug, Clone)]
pub struct Deferred {
    engine: RetrievalEngine,
    request: RequestDescriptor,
    options: FetchOptions,
}

impl Deferred {
    pub(crate) fn new(engine: RetrievalEngine, request: RequestDescriptor, options: FetchOptions) -> Self {
        Self {
            engine,
            request,
            options,
        }
    }

    /// The captured (unmerged) request.
    #[must_use]
    pub fn request(&self) -> &RequestDescriptor {
        &self.request
    }

    /// Opens a reader now; see [`RetrievalEngine::fetch`].
    ///
    /// The body is only stored once the reader is [finished](StreamingReader::finish).
    ///
    /// # Errors
    ///
    /// Same as [`RetrievalEngine::fetch`].
    pub fn open(&self) -> Result<StreamingReader, FetchError> {
        self.engine.fetch(&self.request, &self.options)
    }

    /// Loads the value now; see [`RetrievalEngine::load`].
    ///
    /// # Errors
    ///
    /// Same as [`RetrievalEngine::load`].
    pub fn load<T: Loadable>(&self) -> Result<T, FetchError> {
        self.engine.load(&self.request, &self.options)
    }
}
