//! HTTP transport.
//!
//! The engine talks to the network through the [`Fetcher`] trait. [`HttpFetcher`] is
//! the production implementation on top of the blocking reqwest client: GET only, no
//! redirect following, raw (undecoded) bodies, optional TLS client certificates and
//! optional certificate fingerprint pinning, enforced during the TLS handshake.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::ACCEPT_ENCODING;
use reqwest::redirect::Policy;
use reqwest::tls::Identity;
use tracing::{debug, instrument};
use url::Url;

use super::FetchError;
use super::pinning::{pinned_client_config, presented_fingerprint};
use crate::cache::ResponseMetadata;
use crate::config::{ConfigError, SourceConfig};
use crate::request::{ClientCert, RequestDescriptor};

/// Encodings the reader can undo, advertised when the request does not choose its own.
const SUPPORTED_ENCODINGS: &str = "gzip, deflate";

/// Network side of a retrieval.
pub trait Fetcher: Send + Sync + fmt::Debug {
    /// Sends a GET for the effective `request` and returns the response head with an
    /// unread body. Statuses are never treated as errors here.
    ///
    /// # Errors
    ///
    /// Returns transport errors ([`FetchError::Network`], [`FetchError::Timeout`]),
    /// [`FetchError::InvalidUrl`] and certificate problems.
    fn get(&self, request: &RequestDescriptor) -> Result<FetchResponse, FetchError>;
}

/// Response head plus unread body.
pub struct FetchResponse {
    /// Final URL (including the encoded query).
    pub url: String,
    /// Numeric status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Protocol version, e.g. `HTTP/1.1`.
    pub http_version: String,
    /// Headers; repeated headers keep every value.
    pub headers: BTreeMap<String, Vec<String>>,
    /// Time until the response head arrived.
    pub elapsed: Duration,
    /// Raw body, still content-encoded.
    pub body: Box<dyn Read + Send>,
}

impl FetchResponse {
    /// First value of header `name`, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    /// Splits the response into its metadata record and body.
    #[must_use]
    pub fn into_parts(self) -> (ResponseMetadata, Box<dyn Read + Send>) {
        let metadata = ResponseMetadata::capture(
            self.url,
            self.http_version,
            self.status,
            self.reason,
            self.headers,
            self.elapsed,
        );
        (metadata, self.body)
    }
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("http_version", &self.http_version)
            .field("headers", &self.headers)
            .field("elapsed", &self.elapsed)
            .finish_non_exhaustive()
    }
}

/// [`Fetcher`] backed by the blocking reqwest client.
///
/// One reqwest client is built lazily per client certificate and reused, so connections
/// are pooled per certificate.
#[derive(Debug)]
pub struct HttpFetcher {
    connect_timeout: Duration,
    timeout: Duration,
    verify_tls: bool,
    fingerprint: Option<String>,
    clients: Mutex<HashMap<Option<ClientCert>, Client>>,
}

impl HttpFetcher {
    /// Creates a fetcher with the timeouts of `config`, verifying TLS certificates.
    #[must_use]
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            timeout: config.timeout(),
            verify_tls: true,
            fingerprint: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Enables or disables TLS certificate verification.
    #[must_use]
    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Pins HTTPS servers to the certificate with this SHA-256 fingerprint.
    ///
    /// The fingerprint is hex, case-insensitive, optionally colon-separated.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when `fingerprint` is not 32 hex bytes.
    pub fn require_fingerprint(mut self, fingerprint: &str) -> Result<Self, ConfigError> {
        self.fingerprint = Some(normalize_fingerprint(fingerprint)?);
        Ok(self)
    }

    fn client(&self, cert: Option<&ClientCert>, url: &str) -> Result<Client, FetchError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&cert.cloned()) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.timeout)
            .redirect(Policy::none());
        match self.fingerprint.as_deref() {
            Some(expected) => {
                let pem = cert.map(read_client_pem).transpose()?;
                let tls = pinned_client_config(expected, self.verify_tls, pem.as_deref())
                    .map_err(|source| FetchError::tls(url, source))?;
                builder = builder.use_preconfigured_tls(tls);
            }
            None => {
                builder = builder.danger_accept_invalid_certs(!self.verify_tls);
                if let Some(cert) = cert {
                    builder = builder.identity(load_identity(cert, url)?);
                }
            }
        }
        let client = builder
            .build()
            .map_err(|source| FetchError::network(url, source))?;
        debug!(
            with_cert = cert.is_some(),
            pinned = self.fingerprint.is_some(),
            "http client built"
        );
        clients.insert(cert.cloned(), client.clone());
        Ok(client)
    }

    fn send_error(&self, url: &Url, source: reqwest::Error) -> FetchError {
        if let Some(expected) = &self.fingerprint
            && let Some(actual) = presented_fingerprint(&source)
        {
            return FetchError::Fingerprint {
                url: url.to_string(),
                expected: expected.clone(),
                actual,
            };
        }
        FetchError::network(url.as_str(), source)
    }
}

impl Fetcher for HttpFetcher {
    #[instrument(skip(self, request), fields(url = %request.path()))]
    fn get(&self, request: &RequestDescriptor) -> Result<FetchResponse, FetchError> {
        let url = request_url(request)?;
        let client = self.client(request.cert(), url.as_str())?;

        let mut builder = client.get(url.clone());
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.to_string());
        }
        if request.header(ACCEPT_ENCODING.as_str()).is_none() {
            builder = builder.header(ACCEPT_ENCODING, SUPPORTED_ENCODINGS);
        }

        let started = Instant::now();
        let response = builder
            .send()
            .map_err(|source| self.send_error(&url, source))?;
        let elapsed = started.elapsed();

        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        let status = response.status();
        debug!(status = status.as_u16(), elapsed_ms = elapsed.as_millis(), "response received");

        Ok(FetchResponse {
            url: url.to_string(),
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            http_version: format!("{:?}", response.version()),
            headers,
            elapsed,
            body: Box::new(response),
        })
    }
}

/// Builds the wire URL of `request`: its path with params appended to the query.
///
/// # Errors
///
/// Returns [`FetchError::InvalidUrl`] unless the path is an absolute http(s) URL.
pub fn request_url(request: &RequestDescriptor) -> Result<Url, FetchError> {
    let mut url = Url::parse(request.path()).map_err(|_| FetchError::invalid_url(request.path()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::invalid_url(request.path()));
    }
    if !request.params().is_empty() {
        let mut query = url.query_pairs_mut();
        for (key, value) in request.params() {
            query.append_pair(key, &value.to_string());
        }
    }
    Ok(url)
}

/// Certificate chain and private key of `cert` as one PEM buffer.
fn read_client_pem(cert: &ClientCert) -> Result<Vec<u8>, FetchError> {
    let read = |path: &Path| fs::read(path).map_err(|source| FetchError::io(path, source));
    match cert {
        ClientCert::Pem(path) => read(path),
        ClientCert::Pair { cert, key } => {
            let mut pem = read(cert)?;
            pem.push(b'\n');
            pem.extend(read(key)?);
            Ok(pem)
        }
    }
}

fn load_identity(cert: &ClientCert, url: &str) -> Result<Identity, FetchError> {
    let pem = read_client_pem(cert)?;
    Identity::from_pem(&pem).map_err(|source| FetchError::network(url, source))
}

fn normalize_fingerprint(raw: &str) -> Result<String, ConfigError> {
    let normalized: String = raw
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if normalized.len() != 64 || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::invalid_value(
            "require_fingerprint",
            "expected a SHA-256 fingerprint (64 hex digits, colons allowed)",
        ));
    }
    Ok(normalized)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_request_url_appends_params() {
        let request = RequestDescriptor::new("https://example.com/api?fixed=1")
            .with_param("shop", 1)
            .with_param("lang", "en us");
        let url = request_url(&request).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/api?fixed=1&lang=en+us&shop=1"
        );
    }

    #[test]
    fn test_request_url_without_params_is_unchanged() {
        let url = request_url(&RequestDescriptor::new("http://test/a")).unwrap();
        assert_eq!(url.as_str(), "http://test/a");
    }

    #[test]
    fn test_request_url_rejects_non_http() {
        for path in ["relative/path", "ftp://example.com/file", "file:///etc/passwd"] {
            let err = request_url(&RequestDescriptor::new(path)).unwrap_err();
            assert!(matches!(err, FetchError::InvalidUrl { .. }), "{path}");
        }
    }

    #[test]
    fn test_normalize_fingerprint() {
        let colons = "AB:".repeat(31) + "AB";
        assert_eq!(normalize_fingerprint(&colons).unwrap(), "ab".repeat(32));
        assert!(normalize_fingerprint("abcd").is_err());
        assert!(normalize_fingerprint(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_missing_client_cert_is_io_error() {
        let cert = ClientCert::Pem(PathBuf::from("/nonexistent/client.pem"));
        let err = load_identity(&cert, "https://example.com").unwrap_err();
        assert!(matches!(err, FetchError::Io { .. }));
    }

    #[test]
    fn test_pinned_fetcher_builds_client() {
        let fetcher = HttpFetcher::new(&SourceConfig::default())
            .verify_tls(false)
            .require_fingerprint(&"ab".repeat(32))
            .unwrap();
        assert!(fetcher.client(None, "https://example.com").is_ok());
    }

    #[test]
    fn test_pinned_fetcher_missing_client_cert_is_io_error() {
        let fetcher = HttpFetcher::new(&SourceConfig::default())
            .require_fingerprint(&"ab".repeat(32))
            .unwrap();
        let cert = ClientCert::Pem(PathBuf::from("/nonexistent/client.pem"));
        let err = fetcher.client(Some(&cert), "https://example.com").unwrap_err();
        assert!(matches!(err, FetchError::Io { .. }));
    }

    #[test]
    fn test_pinned_fetcher_rejects_unusable_client_pem() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("client.pem");
        fs::write(&path, b"not a pem file").unwrap();

        let fetcher = HttpFetcher::new(&SourceConfig::default())
            .require_fingerprint(&"ab".repeat(32))
            .unwrap();
        let err = fetcher
            .client(Some(&ClientCert::Pem(path)), "https://example.com")
            .unwrap_err();
        assert_eq!(err.kind(), crate::fetch::ErrorKind::Tls);
    }

    #[test]
    fn test_into_parts_captures_metadata() {
        let response = FetchResponse {
            url: "http://test/a".to_string(),
            status: 404,
            reason: "Not Found".to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers: BTreeMap::from([("etag".to_string(), vec!["\"x\"".to_string()])]),
            elapsed: Duration::from_millis(7),
            body: Box::new(std::io::empty()),
        };
        assert_eq!(response.header("ETag"), Some("\"x\""));

        let (metadata, _) = response.into_parts();
        assert_eq!(metadata.status, 404);
        assert_eq!(metadata.status_reason, "Not Found");
        assert_eq!(metadata.elapsed_milliseconds, 7);
    }
}
