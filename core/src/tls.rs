use crate::error::{KuromeError, Result};
use crate::security::SecurityProvider;
use rustls::DistinguishedName;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, info, warn};

/// Name presented in the ClientHello. Peers are identified by certificate, so
/// the name is never checked.
const TLS_SERVER_NAME: &str = "kurome.local";

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

/// An authenticated TLS stream and the certificate the peer presented.
pub struct SecureChannel<IO> {
    pub stream: TlsStream<IO>,
    pub peer_certificate: CertificateDer<'static>,
}

/// Upgrades raw streams to mutually authenticated TLS.
///
/// Without a pinned certificate any peer certificate is accepted and handed
/// back to the caller (trust on first use). With one, the peer must present
/// exactly that certificate.
pub struct SecureChannelFactory {
    certificate: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
    provider: Arc<CryptoProvider>,
    handshake_timeout: Duration,
}

impl SecureChannelFactory {
    pub fn new(
        certificate: CertificateDer<'static>,
        key: PrivatePkcs8KeyDer<'static>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            certificate,
            key,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            handshake_timeout,
        }
    }

    pub fn from_provider(security: &dyn SecurityProvider, handshake_timeout: Duration) -> Self {
        Self::new(
            security.identity_certificate(),
            security.key_pair(),
            handshake_timeout,
        )
    }

    pub async fn upgrade<IO>(
        &self,
        io: IO,
        role: HandshakeRole,
        trusted_peer_cert: Option<CertificateDer<'static>>,
    ) -> Result<SecureChannel<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let verifier = Arc::new(PeerVerifier {
            pinned: trusted_peer_cert,
            algorithms: self.provider.signature_verification_algorithms,
        });

        let handshake = async {
            match role {
                HandshakeRole::Client => self.connect(io, verifier).await,
                HandshakeRole::Server => self.accept(io, verifier).await,
            }
        };

        let channel = timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| KuromeError::Handshake("handshake timed out".to_string()))??;

        debug!(
            "TLS handshake complete as {:?}, peer fingerprint {}",
            role,
            fingerprint(&channel.peer_certificate)
        );
        Ok(channel)
    }

    async fn connect<IO>(&self, io: IO, verifier: Arc<PeerVerifier>) -> Result<SecureChannel<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let config = rustls::ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(vec![self.certificate.clone()], self.key.clone_key().into())?;

        let server_name = ServerName::try_from(TLS_SERVER_NAME)
            .map_err(|e| KuromeError::Handshake(e.to_string()))?;

        let stream = TlsConnector::from(Arc::new(config))
            .connect(server_name, io)
            .await
            .map_err(|e| KuromeError::Handshake(e.to_string()))?;

        let peer_certificate = first_certificate(stream.get_ref().1.peer_certificates())?;
        Ok(SecureChannel {
            stream: TlsStream::from(stream),
            peer_certificate,
        })
    }

    async fn accept<IO>(&self, io: IO, verifier: Arc<PeerVerifier>) -> Result<SecureChannel<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let config = rustls::ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.certificate.clone()], self.key.clone_key().into())?;

        let stream = TlsAcceptor::from(Arc::new(config))
            .accept(io)
            .await
            .map_err(|e| KuromeError::Handshake(e.to_string()))?;

        let peer_certificate = first_certificate(stream.get_ref().1.peer_certificates())?;
        Ok(SecureChannel {
            stream: TlsStream::from(stream),
            peer_certificate,
        })
    }
}

fn first_certificate(
    certificates: Option<&[CertificateDer<'static>]>,
) -> Result<CertificateDer<'static>> {
    certificates
        .and_then(|certs| certs.first())
        .cloned()
        .ok_or_else(|| KuromeError::Handshake("peer presented no certificate".to_string()))
}

/// Lowercase hex SHA-256 of the certificate DER.
pub fn fingerprint(certificate: &CertificateDer<'_>) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(certificate.as_ref());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug)]
struct PeerVerifier {
    pinned: Option<CertificateDer<'static>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PeerVerifier {
    fn check(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        match &self.pinned {
            Some(pinned) if pinned.as_ref() == end_entity.as_ref() => Ok(()),
            Some(_) => {
                warn!(
                    "Rejected peer certificate {}: does not match the pinned certificate",
                    fingerprint(end_entity)
                );
                Err(rustls::Error::General(
                    "peer certificate does not match the trusted certificate".to_string(),
                ))
            }
            None => {
                info!(
                    "Accepting unknown peer certificate {} (first contact)",
                    fingerprint(end_entity)
                );
                Ok(())
            }
        }
    }
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for PeerVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn identity() -> (CertificateDer<'static>, PrivatePkcs8KeyDer<'static>) {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec![TLS_SERVER_NAME.to_string()]).unwrap();
        (
            cert.der().clone(),
            PrivatePkcs8KeyDer::from(signing_key.serialize_der()),
        )
    }

    fn factory() -> (SecureChannelFactory, CertificateDer<'static>) {
        let (cert, key) = identity();
        (
            SecureChannelFactory::new(cert.clone(), key, Duration::from_secs(5)),
            cert,
        )
    }

    #[tokio::test]
    async fn test_first_contact_captures_peer_certificates() {
        let (client, client_cert) = factory();
        let (server, server_cert) = factory();
        let (a, b) = tokio::io::duplex(16 * 1024);

        let (client_side, server_side) = tokio::join!(
            client.upgrade(a, HandshakeRole::Client, None),
            server.upgrade(b, HandshakeRole::Server, None),
        );
        let mut client_side = client_side.unwrap();
        let mut server_side = server_side.unwrap();

        assert_eq!(client_side.peer_certificate, server_cert);
        assert_eq!(server_side.peer_certificate, client_cert);

        client_side.stream.write_all(b"hello").await.unwrap();
        client_side.stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        server_side.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_pinned_certificate_must_match() {
        let (client, client_cert) = factory();
        let (server, server_cert) = factory();
        let (a, b) = tokio::io::duplex(16 * 1024);

        let (client_side, server_side) = tokio::join!(
            client.upgrade(a, HandshakeRole::Client, Some(server_cert)),
            server.upgrade(b, HandshakeRole::Server, Some(client_cert)),
        );
        assert!(client_side.is_ok());
        assert!(server_side.is_ok());
    }

    #[tokio::test]
    async fn test_pinned_mismatch_is_rejected() {
        let (client, _) = factory();
        let (server, _) = factory();
        let (impostor_cert, _) = identity();
        let (a, b) = tokio::io::duplex(16 * 1024);

        let (client_side, _server_side) = tokio::join!(
            client.upgrade(a, HandshakeRole::Client, Some(impostor_cert)),
            server.upgrade(b, HandshakeRole::Server, None),
        );
        assert!(matches!(client_side, Err(KuromeError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let (cert, key) = identity();
        let factory = SecureChannelFactory::new(cert, key, Duration::from_millis(50));
        let (a, _silent_peer) = tokio::io::duplex(1024);

        let result = factory.upgrade(a, HandshakeRole::Server, None).await;
        assert!(matches!(result, Err(KuromeError::Handshake(_))));
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let (cert, _) = identity();
        let fp = fingerprint(&cert);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint(&cert));
    }
}
