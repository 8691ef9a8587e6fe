//! TLS client setup for the outbound control channel

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio_tungstenite::Connector;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("failed to read CA certificate {path}: {reason}")]
    CaCert { path: String, reason: String },
}

/// Build the TLS connector for the WebSocket client: webpki roots, an
/// optional extra CA (self-signed relays), or certificate verification
/// disabled entirely for development.
pub fn build_connector(insecure: bool, ca_cert: Option<&Path>) -> Result<Connector, TlsError> {
    ensure_crypto_provider();

    if insecure {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth();
        return Ok(Connector::Rustls(Arc::new(config)));
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_cert {
        for cert in load_certs(path)? {
            roots.add(cert).map_err(|e| TlsError::CaCert {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        }
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Connector::Rustls(Arc::new(config)))
}

fn load_certs(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TlsError> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::CaCert {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut reader = std::io::BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CaCert {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

// Initialize rustls crypto provider once per process.
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
