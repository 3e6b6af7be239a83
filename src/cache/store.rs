//! Cache stores: where cached bodies and their metadata live.
//!
//! A store maps a [`CacheKey`] to a body plus optional [`ResponseMetadata`]. Writes go
//! through a [`CacheWriter`], which buffers the body out of sight and only makes it
//! visible on [`CacheWriter::commit`]. Dropping an uncommitted writer discards it.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use super::{CacheKey, ResponseMetadata};
use crate::fetch::CacheWriteError;

/// Suffix of the metadata sidecar next to a cached body.
pub const METADATA_SUFFIX: &str = "meta";

/// Suffix of an in-progress write.
pub const TEMP_SUFFIX: &str = "tmp";

/// A stored response.
pub struct CacheEntry {
    /// Body reader, positioned at the start.
    pub body: Box<dyn Read + Send>,
    /// Exact body size in bytes.
    pub size: u64,
    /// Stored metadata; `None` means the entry was stored without it and is trusted as is.
    pub metadata: Option<ResponseMetadata>,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("size", &self.size)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Key to response storage.
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Looks up a complete entry.
    ///
    /// # Errors
    ///
    /// Returns IO errors other than "not found"; a missing entry is `Ok(None)`.
    fn get(&self, key: &CacheKey) -> io::Result<Option<CacheEntry>>;

    /// Starts writing the entry for `key`. Nothing is visible until the writer commits.
    ///
    /// # Errors
    ///
    /// Returns [`CacheWriteError`] when the store cannot accept the write.
    fn begin_write(&self, key: &CacheKey) -> Result<Box<dyn CacheWriter>, CacheWriteError>;
}

/// Pending cache entry. Bytes written to it are invisible until [`CacheWriter::commit`].
pub trait CacheWriter: Write + Send {
    /// Publishes the written body, with `metadata` as sidecar record.
    ///
    /// Metadata is stored before the body becomes visible. `None` removes any stale
    /// metadata so the entry reads back as stored without it.
    ///
    /// # Errors
    ///
    /// Returns [`CacheWriteError`] when publishing fails; the pending body is discarded.
    fn commit(self: Box<Self>, metadata: Option<&ResponseMetadata>) -> Result<(), CacheWriteError>;
}

/// Filesystem store rooted at a directory.
///
/// Layout: `<root>/<key>` holds the body, `<root>/<key>.meta` the JSON metadata and
/// `<root>/<key>.tmp` an in-progress write.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    root: PathBuf,
}

impl FileCacheStore {
    /// Creates a store rooted at `root`. The directory is created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the body file for `key`.
    #[must_use]
    pub fn body_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Path of the metadata sidecar for `key`.
    #[must_use]
    pub fn metadata_path(&self, key: &CacheKey) -> PathBuf {
        with_suffix(&self.body_path(key), METADATA_SUFFIX)
    }

    fn read_metadata(path: &Path) -> io::Result<Option<ResponseMetadata>> {
        match fs::read(path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl CacheStore for FileCacheStore {
    fn get(&self, key: &CacheKey) -> io::Result<Option<CacheEntry>> {
        let body_path = self.body_path(key);
        let file = match File::open(&body_path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        // A longer key can turn this path into a directory.
        let stat = file.metadata()?;
        if !stat.is_file() {
            debug!(key = %key, path = %body_path.display(), "cache path is not a file");
            return Ok(None);
        }
        let size = stat.len();
        let metadata = Self::read_metadata(&self.metadata_path(key))?;
        Ok(Some(CacheEntry {
            body: Box::new(file),
            size,
            metadata,
        }))
    }

    fn begin_write(&self, key: &CacheKey) -> Result<Box<dyn CacheWriter>, CacheWriteError> {
        let final_path = self.body_path(key);
        let temp_path = with_suffix(&final_path, TEMP_SUFFIX);
        let fail = |source| CacheWriteError::new(key.to_string(), source);

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(fail)?;
        }
        let file = File::create(&temp_path).map_err(fail)?;
        debug!(key = %key, path = %temp_path.display(), "cache write started");

        Ok(Box::new(FileCacheWriter {
            key: key.to_string(),
            file: Some(BufWriter::new(file)),
            metadata_path: with_suffix(&final_path, METADATA_SUFFIX),
            temp_path,
            final_path,
        }))
    }
}

struct FileCacheWriter {
    key: String,
    file: Option<BufWriter<File>>,
    temp_path: PathBuf,
    final_path: PathBuf,
    metadata_path: PathBuf,
}

impl FileCacheWriter {
    fn publish(&mut self, metadata: Option<&ResponseMetadata>) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.into_inner().map_err(io::IntoInnerError::into_error)?.sync_all()?;
        }

        match metadata {
            Some(metadata) => {
                let raw = serde_json::to_vec_pretty(metadata).map_err(io::Error::other)?;
                let staged = with_suffix(&self.metadata_path, TEMP_SUFFIX);
                fs::write(&staged, raw)?;
                fs::rename(&staged, &self.metadata_path)?;
            }
            None => match fs::remove_file(&self.metadata_path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
                _ => {}
            },
        }

        fs::rename(&self.temp_path, &self.final_path).inspect_err(|_| {
            if metadata.is_some() {
                let _ = fs::remove_file(&self.metadata_path);
            }
        })
    }
}

impl Write for FileCacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("cache writer already committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().map_or(Ok(()), Write::flush)
    }
}

impl CacheWriter for FileCacheWriter {
    fn commit(mut self: Box<Self>, metadata: Option<&ResponseMetadata>) -> Result<(), CacheWriteError> {
        self.publish(metadata)
            .map_err(|source| CacheWriteError::new(self.key.clone(), source))?;
        debug!(key = %self.key, path = %self.final_path.display(), "cache entry stored");
        Ok(())
    }
}

impl Drop for FileCacheWriter {
    fn drop(&mut self) {
        // Closes the temp file first; after a successful publish this is a no-op.
        self.file = None;
        match fs::remove_file(&self.temp_path) {
            Ok(()) => debug!(key = %self.key, "pending cache write discarded"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                key = %self.key,
                path = %self.temp_path.display(),
                error = %err,
                "failed to remove temporary cache file"
            ),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".");
    raw.push(suffix);
    PathBuf::from(raw)
}

type MemoryEntries = HashMap<CacheKey, (Arc<Vec<u8>>, Option<ResponseMetadata>)>;

/// In-process store, mainly for tests and short-lived tools.
///
/// Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<Mutex<MemoryEntries>>,
}

impl MemoryCacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stored body and metadata for `key`.
    #[must_use]
    pub fn entry(&self, key: &CacheKey) -> Option<(Vec<u8>, Option<ResponseMetadata>)> {
        self.lock()
            .get(key)
            .map(|(body, metadata)| (body.as_ref().clone(), metadata.clone()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryEntries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &CacheKey) -> io::Result<Option<CacheEntry>> {
        Ok(self.lock().get(key).map(|(body, metadata)| CacheEntry {
            size: body.len() as u64,
            body: Box::new(Cursor::new(SharedBytes(Arc::clone(body)))),
            metadata: metadata.clone(),
        }))
    }

    fn begin_write(&self, key: &CacheKey) -> Result<Box<dyn CacheWriter>, CacheWriteError> {
        Ok(Box::new(MemoryCacheWriter {
            entries: Arc::clone(&self.entries),
            key: key.clone(),
            buffer: Vec::new(),
        }))
    }
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

struct MemoryCacheWriter {
    entries: Arc<Mutex<MemoryEntries>>,
    key: CacheKey,
    buffer: Vec<u8>,
}

impl Write for MemoryCacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CacheWriter for MemoryCacheWriter {
    fn commit(self: Box<Self>, metadata: Option<&ResponseMetadata>) -> Result<(), CacheWriteError> {
        let Self {
            entries,
            key,
            buffer,
        } = *self;
        entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, (Arc::new(buffer), metadata.cloned()));
        Ok(())
    }
}
