//! Streaming response bodies.
//!
//! A [`StreamingReader`] wraps either a live response body or a cached entry and is
//! consumed through [`std::io::Read`] or [`StreamingReader::read_chunk`]. Live bodies may
//! be teed into the cache: every byte handed to the caller is also written to a pending
//! [`CacheWriter`], which is committed by [`StreamingReader::finish`] after the rest of the
//! body has been drained.
//!
//! Teardown rules:
//! - `finish` drains, checks completeness and commits the pending entry
//! - `close` (or dropping the reader) discards the pending entry
//! - a failed read discards the pending entry; a later `finish` reports
//!   [`CacheOutcome::Discarded`]
//! - `close_with_error` finishes when the error kind is on the store-on-error allow-list
//!   and closes otherwise
//!
//! [`StreamingReader::offset`] counts bytes consumed from the wire, before any
//! `Content-Encoding` is undone.

use std::fmt;
use std::io::{self, Read};

use flate2::read::{GzDecoder, ZlibDecoder};
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheWriter, ResponseMetadata};
use crate::fetch::{ErrorKind, FetchError, ReaderError};

/// What happened (or will happen) to the cache entry of a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The body is not being stored.
    NotCached,
    /// The body was served from the cache.
    Hit,
    /// The body is being teed; the entry is committed by `finish`.
    Pending,
    /// The entry was committed.
    Stored,
    /// The pending entry was discarded.
    Discarded,
    /// The store rejected the entry; the body was still delivered.
    Failed,
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.count += read as u64;
        Ok(read)
    }
}

type RawBody = CountingReader<Box<dyn Read + Send>>;

enum BodyDecoder {
    Identity(RawBody),
    Gzip(GzDecoder<RawBody>),
    Deflate(ZlibDecoder<RawBody>),
}

impl BodyDecoder {
    fn new(body: Box<dyn Read + Send>, encoding: Option<&str>, url: &str) -> Self {
        let raw = CountingReader {
            inner: body,
            count: 0,
        };
        match encoding {
            None => Self::Identity(raw),
            Some("gzip" | "x-gzip") => Self::Gzip(GzDecoder::new(raw)),
            Some("deflate") => Self::Deflate(ZlibDecoder::new(raw)),
            Some(other) => {
                warn!(url, encoding = other, "unsupported content encoding, passing body through");
                Self::Identity(raw)
            }
        }
    }

    fn wire_offset(&self) -> u64 {
        match self {
            Self::Identity(raw) => raw.count,
            Self::Gzip(decoder) => decoder.get_ref().count,
            Self::Deflate(decoder) => decoder.get_ref().count,
        }
    }
}

impl Read for BodyDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Identity(raw) => raw.read(buf),
            Self::Gzip(decoder) => decoder.read(buf),
            Self::Deflate(decoder) => decoder.read(buf),
        }
    }
}

struct Tee {
    key: String,
    writer: Box<dyn CacheWriter>,
    metadata: Option<ResponseMetadata>,
}

/// Lazily-read response body.
///
/// A teed body is only stored by [`StreamingReader::finish`]. Dropping the reader, even
/// after reading it to the end, discards the pending entry, so callers of
/// [`crate::Deferred::open`] must call `finish` to populate the cache.
pub struct StreamingReader {
    url: String,
    body: Option<BodyDecoder>,
    closed_offset: u64,
    size_hint: Option<u64>,
    expected_wire_len: Option<u64>,
    metadata: Option<ResponseMetadata>,
    tee: Option<Tee>,
    outcome: CacheOutcome,
    store_on_error: Vec<ErrorKind>,
    chunk_size: usize,
    eof: bool,
}

impl StreamingReader {
    /// Wraps a live response body described by `metadata`.
    ///
    /// `Content-Encoding` is undone while reading. The size hint is the `Content-Length`
    /// when no encoding is applied.
    pub(crate) fn live(
        body: Box<dyn Read + Send>,
        metadata: ResponseMetadata,
        chunk_size: usize,
    ) -> Self {
        let encoding = metadata.content_encoding();
        let content_length = metadata.content_length();
        Self {
            body: Some(BodyDecoder::new(body, encoding.as_deref(), &metadata.url)),
            url: metadata.url.clone(),
            closed_offset: 0,
            size_hint: content_length.filter(|_| encoding.is_none()),
            expected_wire_len: content_length,
            metadata: Some(metadata),
            tee: None,
            outcome: CacheOutcome::NotCached,
            store_on_error: Vec::new(),
            chunk_size,
            eof: false,
        }
    }

    /// Wraps a cached entry; the size is known exactly.
    pub(crate) fn cached(url: impl Into<String>, entry: CacheEntry, chunk_size: usize) -> Self {
        Self {
            url: url.into(),
            body: Some(BodyDecoder::new(entry.body, None, "")),
            closed_offset: 0,
            size_hint: Some(entry.size),
            expected_wire_len: Some(entry.size),
            metadata: entry.metadata,
            tee: None,
            outcome: CacheOutcome::Hit,
            store_on_error: Vec::new(),
            chunk_size,
            eof: false,
        }
    }

    /// Tees the body into `writer`, committed with `metadata` on success.
    pub(crate) fn tee_into(
        mut self,
        key: impl Into<String>,
        writer: Box<dyn CacheWriter>,
        metadata: Option<ResponseMetadata>,
    ) -> Self {
        self.tee = Some(Tee {
            key: key.into(),
            writer,
            metadata,
        });
        self.outcome = CacheOutcome::Pending;
        self
    }

    /// Marks the cache entry as rejected by the store before any byte was read.
    pub(crate) fn store_failed(mut self) -> Self {
        self.outcome = CacheOutcome::Failed;
        self
    }

    /// Error kinds for which [`StreamingReader::close_with_error`] still stores the body.
    #[must_use]
    pub fn store_on_error(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.store_on_error = kinds.into_iter().collect();
        self
    }

    /// URL of the response.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Body size when known up front.
    #[must_use]
    pub fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    /// Bytes consumed from the underlying stream so far.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.body
            .as_ref()
            .map_or(self.closed_offset, BodyDecoder::wire_offset)
    }

    /// Response metadata. `None` for cache entries stored without it.
    #[must_use]
    pub fn metadata(&self) -> Option<&ResponseMetadata> {
        self.metadata.as_ref()
    }

    /// Response status, when metadata is available.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.metadata.as_ref().map(|metadata| metadata.status)
    }

    /// Cache outcome so far.
    #[must_use]
    pub fn cache_outcome(&self) -> CacheOutcome {
        self.outcome
    }

    /// Whether the body came from the cache.
    #[must_use]
    pub fn is_from_cache(&self) -> bool {
        self.outcome == CacheOutcome::Hit
    }

    /// Whether the end of the body was reached.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.eof
    }

    /// Whether the reader was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.body.is_none()
    }

    /// Reads the next chunk of at most the configured chunk size; `None` at the end.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Reader`] after close or on truncation, and
    /// [`FetchError::Read`] / [`FetchError::Timeout`] for transport failures.
    pub fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        let mut chunk = vec![0; self.chunk_size];
        loop {
            match self.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(read) => {
                    chunk.truncate(read);
                    return Ok(Some(chunk));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(self.to_fetch_error(err)),
            }
        }
    }

    /// Reads the rest of the body.
    ///
    /// # Errors
    ///
    /// Same as [`StreamingReader::read_chunk`].
    pub fn read_all(&mut self) -> Result<Vec<u8>, FetchError> {
        let mut body = Vec::new();
        self.read_to_end(&mut body)
            .map_err(|err| self.to_fetch_error(err))?;
        Ok(body)
    }

    /// Drains the remaining body into the pending cache entry and commits it.
    ///
    /// Without a pending entry the body is left unread. A store rejecting the commit is
    /// logged and reported as [`CacheOutcome::Failed`]. After an earlier read failed the
    /// entry is already gone and the outcome is [`CacheOutcome::Discarded`].
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Closed`] after close, and read errors hit while draining
    /// (the pending entry is discarded in that case).
    pub fn finish(&mut self) -> Result<CacheOutcome, FetchError> {
        if self.body.is_none() {
            return Err(FetchError::reader(&self.url, ReaderError::Closed));
        }

        let mut chunk = vec![0; self.chunk_size];
        while self.tee.is_some() && !self.eof {
            match self.read(&mut chunk) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.abort_tee();
                    return Err(self.to_fetch_error(err));
                }
            }
        }

        if let Some(tee) = self.tee.take() {
            match tee.writer.commit(tee.metadata.as_ref()) {
                Ok(()) => self.outcome = CacheOutcome::Stored,
                Err(err) => {
                    warn!(key = %tee.key, error = %err, "cache write failed");
                    self.outcome = CacheOutcome::Failed;
                }
            }
        }
        Ok(self.outcome)
    }

    /// Aborts the read, discarding any pending cache entry. Later reads fail with
    /// [`ReaderError::Closed`].
    pub fn close(&mut self) {
        self.abort_tee();
        if let Some(body) = self.body.take() {
            self.closed_offset = body.wire_offset();
        }
    }

    /// Tears the reader down because `error` interrupted its consumer.
    ///
    /// Errors whose kind is on the store-on-error allow-list still finish (and store) the
    /// body; anything else discards it.
    pub fn close_with_error(&mut self, error: &FetchError) -> CacheOutcome {
        if self.tee.is_some() && self.store_on_error.contains(&error.kind()) {
            debug!(url = %self.url, error = %error, "storing response despite error");
            if let Err(err) = self.finish() {
                warn!(url = %self.url, error = %err, "failed to drain response");
            }
        }
        self.close();
        self.outcome
    }

    fn abort_tee(&mut self) {
        if let Some(tee) = self.tee.take() {
            debug!(key = %tee.key, "discarding pending cache entry");
            self.outcome = CacheOutcome::Discarded;
        }
    }

    fn tee_bytes(&mut self, bytes: &[u8]) {
        let Some(tee) = self.tee.as_mut() else {
            return;
        };
        if let Err(err) = tee.writer.write_all(bytes) {
            warn!(key = %tee.key, error = %err, "cache write failed, continuing uncached");
            self.tee = None;
            self.outcome = CacheOutcome::Failed;
        }
    }

    fn to_fetch_error(&self, err: io::Error) -> FetchError {
        if err.kind() == io::ErrorKind::TimedOut {
            return FetchError::timeout(&self.url);
        }
        match err.downcast::<ReaderError>() {
            Ok(reader_error) => FetchError::reader(&self.url, reader_error),
            Err(err) => FetchError::read(&self.url, err),
        }
    }
}

impl Read for StreamingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(body) = self.body.as_mut() else {
            return Err(io::Error::other(ReaderError::Closed));
        };
        if buf.is_empty() || self.eof {
            return Ok(0);
        }

        let read = match body.read(buf) {
            Ok(read) => read,
            Err(err) => {
                // A body that failed mid-stream is never stored.
                if err.kind() != io::ErrorKind::Interrupted {
                    self.abort_tee();
                }
                return Err(err);
            }
        };
        if read > 0 {
            self.tee_bytes(&buf[..read]);
            return Ok(read);
        }

        self.eof = true;
        let actual = body.wire_offset();
        if let Some(expected) = self.expected_wire_len
            && actual < expected
        {
            self.abort_tee();
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                ReaderError::Truncated { expected, actual },
            ));
        }
        Ok(0)
    }
}

impl Drop for StreamingReader {
    fn drop(&mut self) {
        if self.tee.is_some() {
            debug!(url = %self.url, "reader dropped before finish");
            self.abort_tee();
        }
    }
}

impl fmt::Debug for StreamingReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingReader")
            .field("url", &self.url)
            .field("size_hint", &self.size_hint)
            .field("offset", &self.offset())
            .field("outcome", &self.outcome)
            .field("eof", &self.eof)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::{Cursor, Write};
    use std::time::Duration;

    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use tempfile::TempDir;

    use super::*;
    use crate::cache::{CacheKey, CacheStore, FileCacheStore, MemoryCacheStore, TEMP_SUFFIX};
    use crate::fetch::CacheWriteError;
    use crate::request::RequestDescriptor;

    const URL: &str = "http://test/a/b";

    fn metadata(headers: &[(&str, &str)]) -> ResponseMetadata {
        let headers = headers
            .iter()
            .map(|(name, value)| ((*name).to_string(), vec![(*value).to_string()]))
            .collect::<BTreeMap<_, _>>();
        ResponseMetadata::capture(URL, "HTTP/1.1", 200, "OK", headers, Duration::ZERO)
    }

    fn live(body: &[u8], headers: &[(&str, &str)]) -> StreamingReader {
        StreamingReader::live(Box::new(Cursor::new(body.to_vec())), metadata(headers), 4)
    }

    fn key() -> CacheKey {
        CacheKey::for_request(&RequestDescriptor::new(URL)).unwrap()
    }

    fn teed(store: &dyn CacheStore, body: &[u8], headers: &[(&str, &str)]) -> StreamingReader {
        let writer = store.begin_write(&key()).unwrap();
        live(body, headers).tee_into(key().to_string(), writer, Some(metadata(headers)))
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CacheWriter for FailingWriter {
        fn commit(self: Box<Self>, _metadata: Option<&ResponseMetadata>) -> Result<(), CacheWriteError> {
            Ok(())
        }
    }

    /// Body that yields its steps in order, then EOF.
    struct ScriptedBody(Vec<io::Result<&'static [u8]>>);

    impl Read for ScriptedBody {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Ok(0);
            }
            let bytes = self.0.remove(0)?;
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok(bytes.len())
        }
    }

    fn scripted(steps: Vec<io::Result<&'static [u8]>>) -> StreamingReader {
        StreamingReader::live(Box::new(ScriptedBody(steps)), metadata(&[]), 4)
    }

    #[test]
    fn test_live_identity_body() {
        let mut reader = live(b"hello world", &[("content-length", "11")]);
        assert_eq!(reader.size_hint(), Some(11));
        assert_eq!(reader.read_chunk().unwrap().unwrap(), b"hell");
        assert_eq!(reader.offset(), 4);
        assert_eq!(reader.read_all().unwrap(), b"o world");
        assert_eq!(reader.offset(), 11);
        assert!(reader.is_finished());
        assert_eq!(reader.read_chunk().unwrap(), None);
        assert_eq!(reader.cache_outcome(), CacheOutcome::NotCached);
    }

    #[test]
    fn test_gzip_body_is_decoded_and_offset_counts_wire_bytes() {
        let plain = b"gzip gzip gzip gzip gzip gzip gzip gzip".repeat(20);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).unwrap();
        let compressed = encoder.finish().unwrap();
        let length = compressed.len().to_string();

        let mut reader = live(
            &compressed,
            &[("content-encoding", "gzip"), ("content-length", &length)],
        );
        assert_eq!(reader.size_hint(), None);
        assert_eq!(reader.read_all().unwrap(), plain);
        assert_eq!(reader.offset(), compressed.len() as u64);
    }

    #[test]
    fn test_deflate_body_is_decoded() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"deflated").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut reader = live(&compressed, &[("content-encoding", "deflate")]);
        assert_eq!(reader.read_all().unwrap(), b"deflated");
    }

    #[test]
    fn test_tee_matches_stored_file() {
        let dir = TempDir::new().unwrap();
        let store = FileCacheStore::new(dir.path());
        let body = b"0123456789abcdef".repeat(10);

        let mut reader = teed(&store, &body, &[]);
        let delivered = reader.read_all().unwrap();
        assert_eq!(reader.finish().unwrap(), CacheOutcome::Stored);

        assert_eq!(delivered, body);
        assert_eq!(std::fs::read(store.body_path(&key())).unwrap(), body);
        assert!(store.metadata_path(&key()).exists());
    }

    #[test]
    fn test_finish_drains_unread_body() {
        let store = MemoryCacheStore::new();
        let mut reader = teed(&store, b"partially read body", &[]);
        assert_eq!(reader.read_chunk().unwrap().unwrap(), b"part");
        assert_eq!(reader.finish().unwrap(), CacheOutcome::Stored);
        assert_eq!(store.entry(&key()).unwrap().0, b"partially read body");
    }

    #[test]
    fn test_close_discards_pending_entry() {
        let dir = TempDir::new().unwrap();
        let store = FileCacheStore::new(dir.path());
        let mut reader = teed(&store, b"body", &[]);
        reader.read_chunk().unwrap();
        reader.close();

        assert_eq!(reader.cache_outcome(), CacheOutcome::Discarded);
        assert!(!store.body_path(&key()).exists());
        let temp = store.body_path(&key()).with_extension(TEMP_SUFFIX);
        assert!(!temp.exists());

        let err = reader.read_chunk().unwrap_err();
        assert!(matches!(
            err,
            FetchError::Reader {
                source: ReaderError::Closed,
                ..
            }
        ));
        assert!(reader.finish().is_err());
    }

    #[test]
    fn test_drop_discards_pending_entry() {
        let store = MemoryCacheStore::new();
        let mut reader = teed(&store, b"body", &[]);
        reader.read_all().unwrap();
        drop(reader);
        assert!(store.is_empty());
    }

    #[test]
    fn test_truncated_body_is_never_stored() {
        let store = MemoryCacheStore::new();
        let mut reader = teed(&store, b"short", &[("content-length", "50")]);

        let err = reader.read_all().unwrap_err();
        assert!(matches!(
            err,
            FetchError::Reader {
                source: ReaderError::Truncated {
                    expected: 50,
                    actual: 5
                },
                ..
            }
        ));
        assert_eq!(reader.finish().unwrap(), CacheOutcome::Discarded);
        assert!(store.is_empty());
    }

    #[test]
    fn test_timeout_mid_body_discards_pending_entry() {
        let dir = TempDir::new().unwrap();
        let store = FileCacheStore::new(dir.path());
        let writer = store.begin_write(&key()).unwrap();
        let mut reader = scripted(vec![
            Ok(&b"par"[..]),
            Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        ])
        .tee_into(key().to_string(), writer, Some(metadata(&[])));

        let err = reader.read_all().unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
        assert_eq!(reader.cache_outcome(), CacheOutcome::Discarded);

        // The stream now reports EOF; the partial body must still not be committed.
        assert_eq!(reader.finish().unwrap(), CacheOutcome::Discarded);
        assert!(store.get(&key()).unwrap().is_none());
        assert!(!store.metadata_path(&key()).exists());
        let temp = store.body_path(&key()).with_extension(TEMP_SUFFIX);
        assert!(!temp.exists());
    }

    #[test]
    fn test_interrupted_read_keeps_pending_entry() {
        let store = MemoryCacheStore::new();
        let writer = store.begin_write(&key()).unwrap();
        let mut reader = scripted(vec![
            Ok(&b"ab"[..]),
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Ok(&b"cd"[..]),
        ])
        .tee_into(key().to_string(), writer, None);

        assert_eq!(reader.read_all().unwrap(), b"abcd");
        assert_eq!(reader.finish().unwrap(), CacheOutcome::Stored);
        assert_eq!(store.entry(&key()).unwrap().0, b"abcd");
    }

    #[test]
    fn test_close_with_allow_listed_error_stores() {
        let store = MemoryCacheStore::new();
        let mut reader = teed(&store, b"error page", &[]).store_on_error([ErrorKind::Status]);

        let outcome = reader.close_with_error(&FetchError::status(URL, 404));
        assert_eq!(outcome, CacheOutcome::Stored);
        assert!(reader.is_closed());
        assert_eq!(store.entry(&key()).unwrap().0, b"error page");
    }

    #[test]
    fn test_close_with_other_error_discards() {
        let store = MemoryCacheStore::new();
        let mut reader = teed(&store, b"body", &[]).store_on_error([ErrorKind::Status]);

        let outcome = reader.close_with_error(&FetchError::load("bad payload"));
        assert_eq!(outcome, CacheOutcome::Discarded);
        assert!(store.is_empty());
    }

    #[test]
    fn test_tee_write_failure_is_not_fatal() {
        let mut reader = live(b"still delivered", &[]).tee_into(
            "http__test/a/b",
            Box::new(FailingWriter),
            None,
        );
        assert_eq!(reader.read_all().unwrap(), b"still delivered");
        assert_eq!(reader.cache_outcome(), CacheOutcome::Failed);
        assert_eq!(reader.finish().unwrap(), CacheOutcome::Failed);
    }

    #[test]
    fn test_cached_reader() {
        let store = MemoryCacheStore::new();
        let mut writer = store.begin_write(&key()).unwrap();
        writer.write_all(b"from cache").unwrap();
        writer.commit(None).unwrap();

        let entry = store.get(&key()).unwrap().unwrap();
        let mut reader = StreamingReader::cached(URL, entry, 4);
        assert!(reader.is_from_cache());
        assert_eq!(reader.size_hint(), Some(10));
        assert!(reader.metadata().is_none());
        assert_eq!(reader.read_all().unwrap(), b"from cache");
        assert_eq!(reader.offset(), 10);
        assert_eq!(reader.finish().unwrap(), CacheOutcome::Hit);
    }
}
