//! Request descriptors: the logical identity of a fetch before it goes on the wire.
//!
//! A [`RequestDescriptor`] is immutable. Engines keep a base descriptor (scheme, host,
//! default headers) and merge each per-call descriptor on top of it with
//! [`RequestDescriptor::merge`] (or `base + call`), producing the effective request that
//! is both sent and used to derive the cache key.
//!
//! # Example
//!
//! ```
//! use reqcache::RequestDescriptor;
//!
//! let base = RequestDescriptor::new("https://example.com/api/")
//!     .with_header("Accept", "application/xml");
//! let call = RequestDescriptor::new("titles/list").with_param("shop", 1);
//!
//! let merged = &base + &call;
//! assert_eq!(merged.path(), "https://example.com/api/titles/list");
//! assert_eq!(merged.params().len(), 1);
//! assert_eq!(merged.headers().len(), 1);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;
use std::path::PathBuf;

use url::Url;

/// Scalar value of a query parameter or header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scalar {
    /// Text value.
    Str(String),
    /// Integer value, rendered in decimal.
    Int(i64),
    /// Raw bytes, rendered lossily as UTF-8.
    Bytes(Vec<u8>),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(value) => f.write_str(value),
            Self::Int(value) => write!(f, "{value}"),
            Self::Bytes(value) => f.write_str(&String::from_utf8_lossy(value)),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Scalar {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<Vec<u8>> for Scalar {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for Scalar {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

/// Ordered parameter/header map. Keys are kept sorted so that encodings derived from it
/// (query strings, cache keys) are canonical regardless of insertion order.
pub type RequestMap = BTreeMap<String, Scalar>;

/// TLS client certificate presented with a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientCert {
    /// Single PEM file holding both the certificate chain and the private key.
    Pem(PathBuf),
    /// Separate certificate and private key PEM files.
    Pair {
        /// Certificate chain.
        cert: PathBuf,
        /// Private key.
        key: PathBuf,
    },
}

/// Immutable description of a logical GET request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDescriptor {
    path: String,
    params: RequestMap,
    headers: RequestMap,
    cert: Option<ClientCert>,
}

impl RequestDescriptor {
    /// Creates a descriptor for `path`, which may be an absolute URL or a path relative to
    /// whatever base it is later merged onto.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Returns a copy with the query parameter `key` set to `value`.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Returns a copy with the header `name` set to `value`, replacing any header whose
    /// name matches case-insensitively.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        insert_header(&mut self.headers, name.into(), value.into());
        self
    }

    /// Returns a copy presenting `cert` as TLS client certificate.
    #[must_use]
    pub fn with_cert(mut self, cert: ClientCert) -> Self {
        self.cert = Some(cert);
        self
    }

    /// URL or relative path of the request.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query parameters, sorted by name.
    #[must_use]
    pub fn params(&self) -> &RequestMap {
        &self.params
    }

    /// Request headers, sorted by name.
    #[must_use]
    pub fn headers(&self) -> &RequestMap {
        &self.headers
    }

    /// Looks up a header case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Scalar> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// TLS client certificate, if any.
    #[must_use]
    pub fn cert(&self) -> Option<&ClientCert> {
        self.cert.as_ref()
    }

    /// Combines `self` (the base) with `other` (the override) into a new descriptor.
    ///
    /// - the path of `other` is resolved relative to the path of `self` like a URL reference
    /// - params and headers are unioned, `other` winning on key collisions (header names
    ///   compare case-insensitively)
    /// - the certificate of `other` is used when set, the one of `self` otherwise
    ///
    /// Neither operand is modified.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut params = self.params.clone();
        params.extend(
            other
                .params
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        let mut headers = self.headers.clone();
        for (name, value) in &other.headers {
            insert_header(&mut headers, name.clone(), value.clone());
        }

        Self {
            path: join_path(&self.path, &other.path),
            params,
            headers,
            cert: other.cert.clone().or_else(|| self.cert.clone()),
        }
    }
}

impl Add for RequestDescriptor {
    type Output = RequestDescriptor;

    fn add(self, other: RequestDescriptor) -> RequestDescriptor {
        self.merge(&other)
    }
}

impl Add<&RequestDescriptor> for &RequestDescriptor {
    type Output = RequestDescriptor;

    fn add(self, other: &RequestDescriptor) -> RequestDescriptor {
        self.merge(other)
    }
}

fn insert_header(headers: &mut RequestMap, name: String, value: Scalar) {
    headers.retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
    headers.insert(name, value);
}

/// Resolves `relative` against `base` the way a browser resolves a link.
///
/// An empty side yields the other one unchanged. Relative bases that are not URLs fall back
/// to directory-style joining.
pub(crate) fn join_path(base: &str, relative: &str) -> String {
    if base.is_empty() {
        return relative.to_string();
    }
    if relative.is_empty() {
        return base.to_string();
    }

    if let Ok(base_url) = Url::parse(base) {
        return base_url
            .join(relative)
            .map_or_else(|_| relative.to_string(), String::from);
    }

    if Url::parse(relative).is_ok() || relative.starts_with('/') {
        return relative.to_string();
    }
    match base.rfind('/') {
        Some(pos) => format!("{}{relative}", &base[..=pos]),
        None => relative.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_override_wins_on_colliding_keys() {
        let base = RequestDescriptor::new("http://test/")
            .with_param("a", 1)
            .with_header("X-Token", "base");
        let call = RequestDescriptor::new("path")
            .with_param("a", 2)
            .with_header("X-Token", "call");

        let merged = base.merge(&call);
        assert_eq!(merged.params().get("a"), Some(&Scalar::Int(2)));
        assert_eq!(merged.header("x-token"), Some(&Scalar::from("call")));
    }

    #[test]
    fn test_merge_unions_disjoint_keys() {
        let base = RequestDescriptor::new("http://test/").with_param("a", 1);
        let call = RequestDescriptor::new("path").with_param("b", "two");

        let merged = &base + &call;
        assert_eq!(merged.params().len(), 2);
        assert_eq!(merged.params().get("a"), Some(&Scalar::Int(1)));
        assert_eq!(merged.params().get("b"), Some(&Scalar::from("two")));
    }

    #[test]
    fn test_merge_header_names_collide_case_insensitively() {
        let base = RequestDescriptor::new("").with_header("User-Agent", "default/1.0");
        let call = RequestDescriptor::new("").with_header("user-agent", "custom/2.0");

        let merged = base.merge(&call);
        assert_eq!(merged.headers().len(), 1);
        assert_eq!(merged.header("USER-AGENT"), Some(&Scalar::from("custom/2.0")));
    }

    #[test]
    fn test_merge_is_associative_for_params_and_headers() {
        let a = RequestDescriptor::new("http://test/")
            .with_param("shared", "a")
            .with_header("X-A", "a");
        let b = RequestDescriptor::new("dir/")
            .with_param("shared", "b")
            .with_header("X-B", "b");
        let c = RequestDescriptor::new("file")
            .with_header("X-A", "c")
            .with_param("only_c", 3);

        let left = (&(&a + &b)) + &c;
        let right = &a + &(&b + &c);

        assert_eq!(left, right);
        assert_eq!(left.path(), "http://test/dir/file");
        assert_eq!(left.params().get("shared"), Some(&Scalar::from("b")));
        assert_eq!(left.header("x-a"), Some(&Scalar::from("c")));
    }

    #[test]
    fn test_merge_does_not_mutate_operands() {
        let base = RequestDescriptor::new("http://test/").with_param("a", 1);
        let call = RequestDescriptor::new("x").with_param("a", 2);
        let base_before = base.clone();
        let call_before = call.clone();

        let _ = base.merge(&call);
        assert_eq!(base, base_before);
        assert_eq!(call, call_before);
    }

    #[test]
    fn test_merge_cert_prefers_override() {
        let base_cert = ClientCert::Pem(PathBuf::from("/etc/base.pem"));
        let call_cert = ClientCert::Pair {
            cert: PathBuf::from("/etc/call.crt"),
            key: PathBuf::from("/etc/call.key"),
        };
        let base = RequestDescriptor::new("").with_cert(base_cert.clone());

        let inherited = base.merge(&RequestDescriptor::new("x"));
        assert_eq!(inherited.cert(), Some(&base_cert));

        let overridden = base.merge(&RequestDescriptor::new("x").with_cert(call_cert.clone()));
        assert_eq!(overridden.cert(), Some(&call_cert));
    }

    #[test]
    fn test_join_path_resolves_like_urls() {
        assert_eq!(join_path("", "http://test/"), "http://test/");
        assert_eq!(join_path("http://test/", ""), "http://test/");
        assert_eq!(join_path("http://test/a/b", "c"), "http://test/a/c");
        assert_eq!(join_path("http://test/a/", "/root"), "http://test/root");
        assert_eq!(
            join_path("http://test/a/", "https://other/x"),
            "https://other/x"
        );
    }

    #[test]
    fn test_join_path_relative_base() {
        assert_eq!(join_path("api/v1/", "items"), "api/v1/items");
        assert_eq!(join_path("api", "items"), "items");
        assert_eq!(join_path("api/", "/abs"), "/abs");
    }

    #[test]
    fn test_scalar_display() {
        assert_eq!(Scalar::from("x").to_string(), "x");
        assert_eq!(Scalar::from(-5).to_string(), "-5");
        assert_eq!(Scalar::from(b"raw".as_slice()).to_string(), "raw");
    }
}
