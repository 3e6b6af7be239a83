//! Response metadata, captured once per live fetch and stored as a `.meta` sidecar.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Status line, headers and timing of a response.
///
/// Header names are stored as received (lowercase for HTTP/2 and reqwest); lookups through
/// [`ResponseMetadata::header`] are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Protocol version, e.g. `HTTP/1.1`.
    pub http_version: String,
    /// Numeric status code.
    pub status: u16,
    /// Canonical reason phrase for the status.
    pub status_reason: String,
    /// Response headers; repeated headers keep every value in order.
    pub headers: BTreeMap<String, Vec<String>>,
    /// Final URL of the request.
    pub url: String,
    /// When the response was received, in seconds since the Unix epoch.
    pub timestamp_seconds: u64,
    /// Time between sending the request and receiving the response head.
    pub elapsed_milliseconds: u64,
}

impl ResponseMetadata {
    /// Captures metadata for a response received now.
    #[must_use]
    pub fn capture(
        url: impl Into<String>,
        http_version: impl Into<String>,
        status: u16,
        status_reason: impl Into<String>,
        headers: BTreeMap<String, Vec<String>>,
        elapsed: Duration,
    ) -> Self {
        let timestamp_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_secs());
        Self {
            http_version: http_version.into(),
            status,
            status_reason: status_reason.into(),
            headers,
            url: url.into(),
            timestamp_seconds,
            elapsed_milliseconds: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// First value of header `name`, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    /// Parsed `Content-Length`, if present and valid.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|value| value.trim().parse().ok())
    }

    /// `Content-Encoding`, lowercased, when it names an actual transform.
    #[must_use]
    pub fn content_encoding(&self) -> Option<String> {
        self.header("content-encoding")
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty() && value != "identity")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn metadata(headers: &[(&str, &str)]) -> ResponseMetadata {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            map.entry((*name).to_string())
                .or_default()
                .push((*value).to_string());
        }
        ResponseMetadata::capture(
            "http://test/a",
            "HTTP/1.1",
            200,
            "OK",
            map,
            Duration::from_millis(42),
        )
    }

    #[test]
    fn test_capture_sets_timing() {
        let meta = metadata(&[]);
        assert_eq!(meta.elapsed_milliseconds, 42);
        assert!(meta.timestamp_seconds > 0);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let meta = metadata(&[("content-type", "text/xml"), ("set-cookie", "a"), ("set-cookie", "b")]);
        assert_eq!(meta.header("Content-Type"), Some("text/xml"));
        assert_eq!(meta.header("SET-COOKIE"), Some("a"));
        assert_eq!(meta.headers["set-cookie"].len(), 2);
        assert_eq!(meta.header("x-missing"), None);
    }

    #[test]
    fn test_content_length_and_encoding() {
        let meta = metadata(&[("content-length", " 128 "), ("content-encoding", "GZIP")]);
        assert_eq!(meta.content_length(), Some(128));
        assert_eq!(meta.content_encoding().as_deref(), Some("gzip"));

        let identity = metadata(&[("content-encoding", "identity")]);
        assert_eq!(identity.content_encoding(), None);
        assert_eq!(identity.content_length(), None);
    }

    #[test]
    fn test_sidecar_json_shape() {
        let meta = metadata(&[("etag", "\"v1\"")]);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["status"], 200);
        assert_eq!(json["status_reason"], "OK");
        assert_eq!(json["headers"]["etag"][0], "\"v1\"");
        assert_eq!(json["elapsed_milliseconds"], 42);

        let parsed: ResponseMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, meta);
    }
}
