//! TLS setup for upstream API clients
//!
//! Three modes: system trust store, skip verification entirely, or pin the
//! server's leaf certificate by SHA-256 fingerprint. Pinning compares the
//! hex-lowercase digest with colons stripped, so fingerprints can be pasted
//! straight from the Proxmox UI.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};

use crate::error::{MonitorError, Result};

/// Certificate verifier that accepts exactly one pinned leaf certificate
#[derive(Debug)]
struct FingerprintVerifier {
    expected: String,
    provider: Arc<CryptoProvider>,
}

impl FingerprintVerifier {
    fn new(fingerprint: &str) -> Self {
        Self {
            expected: normalize_fingerprint(fingerprint),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let actual = hex::encode(Sha256::digest(end_entity.as_ref()));
        if actual == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: expected {}, got {}",
                self.expected, actual
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Strip colons and lowercase, so `AA:BB:..` and `aabb..` both match
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint.replace(':', "").to_lowercase()
}

/// Build an HTTP client for one upstream endpoint.
///
/// `verify_ssl=false` with no fingerprint skips verification; a non-empty
/// fingerprint pins the leaf certificate regardless of `verify_ssl`.
pub fn build_http_client(
    verify_ssl: bool,
    fingerprint: &str,
    timeout: Duration,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(20);

    if !fingerprint.is_empty() {
        let tls = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(FingerprintVerifier::new(fingerprint)))
            .with_no_client_auth();
        builder = builder.use_preconfigured_tls(tls);
    } else if !verify_ssl {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| MonitorError::internal("build_http_client", "", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_normalization() {
        assert_eq!(
            normalize_fingerprint("AA:BB:CC:dd:ee:FF"),
            "aabbccddeeff".to_string()
        );
        assert_eq!(normalize_fingerprint("aabbcc"), "aabbcc");
    }

    #[test]
    fn verifier_accepts_matching_leaf() {
        let cert = CertificateDer::from(vec![1u8, 2, 3, 4]);
        let digest = hex::encode(Sha256::digest(cert.as_ref()));
        let verifier = FingerprintVerifier::new(&digest);

        let name = ServerName::try_from("pve.example.com").unwrap();
        let result =
            verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
    }

    #[test]
    fn verifier_rejects_mismatched_leaf() {
        let cert = CertificateDer::from(vec![1u8, 2, 3, 4]);
        let verifier = FingerprintVerifier::new("00ff00ff");

        let name = ServerName::try_from("pve.example.com").unwrap();
        let result =
            verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_err());
    }
}
