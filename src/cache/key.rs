//! Cache key derivation.
//!
//! A [`CacheKey`] is a relative path with three parts:
//!
//! ```text
//! <scheme__host[:port]>/<url directory>/<filename[---params][---headers]>
//! ```
//!
//! Every part is sanitized on its own, so no input can escape the cache root. Params and
//! headers are encoded as `name+value` pairs joined by `--`, sorted by name. The
//! `User-Agent` header never participates. Segments longer than [`MAX_NAME_LEN`]
//! bytes keep their longest prefix of at most [`MAX_NAME_LEN`] bytes that ends on a
//! character boundary and replace the rest with `_` followed by the SHA-256 of the
//! discarded suffix.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

use crate::fetch::FetchError;
use crate::request::RequestDescriptor;

/// Maximum segment length (in bytes) before hash collapsing kicks in.
pub const MAX_NAME_LEN: usize = 150;

/// Separator between the file name and each encoded pair list.
const SECTION_SEPARATOR: &str = "---";

/// Separator between two encoded pairs.
const PAIR_SEPARATOR: &str = "--";

/// Header excluded from keys; varying it never splits the cache.
const IGNORED_HEADER: &str = "user-agent";

/// Stable, path-safe identifier of a cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    host: String,
    dirs: Vec<String>,
    name: String,
}

impl CacheKey {
    /// Derives the key of an effective (already merged) request.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidUrl`] when the descriptor path is not an absolute URL.
    pub fn for_request(request: &RequestDescriptor) -> Result<Self, FetchError> {
        let url = Url::parse(request.path()).map_err(|_| FetchError::invalid_url(request.path()))?;

        let netloc = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(FetchError::invalid_url(request.path())),
        };
        let host = collapse_long_name(&sanitize_segment(&format!("{}__{netloc}", url.scheme())));

        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.collect())
            .unwrap_or_default();
        let file_name = segments.pop().unwrap_or_default();
        let dirs = segments
            .into_iter()
            .filter(|segment| !segment.is_empty())
            .map(|segment| collapse_long_name(&sanitize_segment(segment)))
            .collect();

        // Query pairs embedded in the URL participate like params; explicit params win.
        let mut params: BTreeMap<String, String> = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        params.extend(
            request
                .params()
                .iter()
                .map(|(key, value)| (key.clone(), value.to_string())),
        );
        let headers = request
            .headers()
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(IGNORED_HEADER))
            .map(|(name, value)| (name.clone(), value.to_string()));

        let mut name = file_name.to_string();
        append_pairs(&mut name, params);
        append_pairs(&mut name, headers);

        Ok(Self {
            host,
            dirs,
            name: collapse_long_name(&sanitize_segment(&name)),
        })
    }

    /// Final path component (the file name of the cached body).
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.name
    }

    /// Key as a relative path below a cache root.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.host);
        path.extend(&self.dirs);
        path.push(&self.name);
        path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)?;
        for dir in &self.dirs {
            write!(f, "/{dir}")?;
        }
        write!(f, "/{}", self.name)
    }
}

fn append_pairs(name: &mut String, pairs: impl IntoIterator<Item = (String, String)>) {
    let encoded: Vec<String> = pairs
        .into_iter()
        .map(|(key, value)| format!("{key}+{value}"))
        .collect();
    if !encoded.is_empty() {
        name.push_str(SECTION_SEPARATOR);
        name.push_str(&encoded.join(PAIR_SEPARATOR));
    }
}

fn collapse_long_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut split = MAX_NAME_LEN;
    while !name.is_char_boundary(split) {
        split -= 1;
    }
    let (prefix, suffix) = name.split_at(split);
    format!("{prefix}_{:x}", Sha256::digest(suffix.as_bytes()))
}

/// Sanitizes a single path segment for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_segment(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

fn is_safe_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
