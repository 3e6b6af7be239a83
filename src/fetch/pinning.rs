//! Certificate fingerprint pinning.
//!
//! Pinning runs inside the TLS handshake: [`PinnedCertVerifier`] rejects a server
//! certificate whose SHA-256 does not match before any request byte is written. With TLS
//! verification on, the certificate chain and host name are then checked against the
//! platform roots, as reqwest does by default.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, aws_lc_rs, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, OtherError, SignatureScheme,
};
use rustls_platform_verifier::Verifier;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Handshake rejection carried inside the rustls error.
#[derive(Debug, Error)]
#[error("server certificate fingerprint {actual} does not match the pinned fingerprint")]
struct FingerprintMismatch {
    actual: String,
}

/// Verifies the server certificate against a pinned SHA-256 fingerprint.
#[derive(Debug)]
pub(crate) struct PinnedCertVerifier {
    expected: String,
    chain: Option<Verifier>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    /// `expected` is normalized lowercase hex. `verify_chain` adds platform validation.
    pub(crate) fn new(
        expected: impl Into<String>,
        verify_chain: bool,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, rustls::Error> {
        let chain = if verify_chain {
            Some(Verifier::new(Arc::clone(&provider))?)
        } else {
            None
        };
        Ok(Self {
            expected: expected.into(),
            chain,
            provider,
        })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = format!("{:x}", Sha256::digest(end_entity.as_ref()));
        if actual != self.expected {
            return Err(rustls::Error::InvalidCertificate(CertificateError::Other(
                OtherError(Arc::new(FingerprintMismatch { actual })),
            )));
        }
        match &self.chain {
            Some(chain) => {
                chain.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client TLS configuration pinned to `expected`, optionally presenting the client
/// certificate and key found in `client_pem`.
pub(crate) fn pinned_client_config(
    expected: &str,
    verify_chain: bool,
    client_pem: Option<&[u8]>,
) -> Result<ClientConfig, PinningSetupError> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let verifier = PinnedCertVerifier::new(expected, verify_chain, Arc::clone(&provider))?;
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));

    let Some(pem) = client_pem else {
        return Ok(builder.with_no_client_auth());
    };
    let chain = CertificateDer::pem_slice_iter(pem).collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_slice(pem)?;
    Ok(builder.with_client_auth_cert(chain, key)?)
}

/// Failure to assemble a pinned TLS configuration.
#[derive(Debug, Error)]
pub(crate) enum PinningSetupError {
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error("invalid client certificate PEM: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),
}

/// Fingerprint the server presented, when `error` is a pinning rejection.
pub(crate) fn presented_fingerprint(error: &(dyn StdError + 'static)) -> Option<String> {
    let mut current = Some(error);
    while let Some(error) = current {
        if let Some(rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(inner)))) =
            error.downcast_ref::<rustls::Error>()
            && let Some(mismatch) = inner.downcast_ref::<FingerprintMismatch>()
        {
            return Some(mismatch.actual.clone());
        }
        // io::Error hides the wrapped error from `source()`.
        current = match error.downcast_ref::<io::Error>().and_then(io::Error::get_ref) {
            Some(inner) => Some(inner as &(dyn StdError + 'static)),
            None => error.source(),
        };
    }
    None
}
