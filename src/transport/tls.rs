//! TLS policy for the WebSocket transport
//!
//! Certificate verification is off by default: the service is reached with
//! any server certificate accepted. Turning `verify` on uses the webpki root
//! set. `pinned_hostname` overrides the name sent in SNI and checked against
//! the certificate.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::{BoxedStream, ConnectError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsPolicy {
    /// Verify the server certificate chain
    pub verify: bool,
    /// Server name to use instead of the endpoint host
    pub pinned_hostname: Option<String>,
}

impl TlsPolicy {
    /// Build the rustls client configuration for this policy
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, ConnectError> {
        let provider = Arc::new(ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| ConnectError::Transport(format!("TLS setup failed: {}", e)))?;

        let config = if self.verify {
            let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
                .with_no_client_auth()
        };

        Ok(Arc::new(config))
    }

    /// Name presented to the server for `host`
    pub fn server_name<'a>(&'a self, host: &'a str) -> &'a str {
        self.pinned_hostname.as_deref().unwrap_or(host)
    }
}

/// Run the TLS handshake over an already established stream
pub async fn handshake(
    policy: &TlsPolicy,
    config: &Arc<ClientConfig>,
    host: &str,
    stream: BoxedStream,
) -> Result<TlsStream<BoxedStream>, ConnectError> {
    let name = policy.server_name(host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|e| ConnectError::Transport(format!("Invalid TLS server name '{}': {}", name, e)))?;

    let connector = TlsConnector::from(Arc::clone(config));
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ConnectError::Transport(format!("TLS handshake with {} failed: {}", name, e)))?;

    debug!("TLS handshake complete with {} (verify: {})", name, policy.verify);
    Ok(tls)
}

/// Verifier that accepts every certificate
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
