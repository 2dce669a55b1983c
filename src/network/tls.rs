use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::config::TlsSettings;

/// TCP connect + TLS handshake budget for one dial attempt
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Every peer connection speaks exactly this protocol version
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Invalid certificate")]
    InvalidCertificate,
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
    #[error("Timed out connecting to {0}")]
    Timeout(String),
}

/// How outbound connections authenticate the peer's certificate
#[derive(Clone, Debug)]
pub enum PeerVerification {
    /// Standard webpki chain validation against the bundled web roots plus
    /// any extra trust anchors (e.g. the overlay's private CA)
    WebPki {
        extra_roots: Vec<CertificateDer<'static>>,
    },
    /// Accept any certificate. Traffic is encrypted but peers are not
    /// authenticated; must be requested explicitly.
    InsecureSkipVerify,
}

impl Default for PeerVerification {
    fn default() -> Self {
        PeerVerification::WebPki {
            extra_roots: Vec::new(),
        }
    }
}

/// TLS configuration for peer connections
#[derive(Clone)]
pub struct TlsConfig {
    client_config: Arc<rustls::ClientConfig>,
    server_config: Option<Arc<rustls::ServerConfig>>,
    /// Overrides the name checked against peer certificates
    server_name: Option<String>,
}

impl TlsConfig {
    /// Outbound-only configuration (no listener identity)
    pub fn client_only(verification: PeerVerification) -> Result<Self, TlsError> {
        Ok(Self {
            client_config: Arc::new(build_client_config(verification)?),
            server_config: None,
            server_name: None,
        })
    }

    /// Generate a self-signed listener identity for `names`
    pub fn new_self_signed(
        names: Vec<String>,
        verification: PeerVerification,
    ) -> Result<Self, TlsError> {
        let cert = rcgen::generate_simple_self_signed(names).map_err(|_| TlsError::InvalidCertificate)?;

        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

        Ok(Self {
            client_config: Arc::new(build_client_config(verification)?),
            server_config: Some(Arc::new(build_server_config(vec![cert_der], key_der)?)),
            server_name: None,
        })
    }

    /// Load the listener identity from PEM files
    pub fn from_pem_files(
        cert_path: &Path,
        key_path: &Path,
        verification: PeerVerification,
    ) -> Result<Self, TlsError> {
        let certs = load_certs(cert_path)?;

        let key_file = std::fs::File::open(key_path)?;
        let mut key_reader = io::BufReader::new(key_file);
        let key =
            rustls_pemfile::private_key(&mut key_reader)?.ok_or(TlsError::InvalidPrivateKey)?;

        Ok(Self {
            client_config: Arc::new(build_client_config(verification)?),
            server_config: Some(Arc::new(build_server_config(certs, key)?)),
            server_name: None,
        })
    }

    /// Build from the `[tls]` config section.
    ///
    /// A listener identity comes from `cert_file`/`key_file` when both are set,
    /// otherwise a self-signed one is generated for `self_signed_names`.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, TlsError> {
        let verification = if settings.insecure_skip_verify {
            tracing::warn!("⚠️  TLS peer certificate verification is DISABLED (insecure_skip_verify)");
            PeerVerification::InsecureSkipVerify
        } else {
            let extra_roots = match &settings.ca_file {
                Some(path) => load_certs(path)?,
                None => Vec::new(),
            };
            PeerVerification::WebPki { extra_roots }
        };

        let config = match (&settings.cert_file, &settings.key_file) {
            (Some(cert), Some(key)) => Self::from_pem_files(cert, key, verification)?,
            _ => Self::new_self_signed(settings.self_signed_names.clone(), verification)?,
        };

        Ok(config.with_server_name(settings.server_name.clone()))
    }

    pub fn with_server_name(mut self, server_name: Option<String>) -> Self {
        self.server_name = server_name;
        self
    }

    pub fn can_accept(&self) -> bool {
        self.server_config.is_some()
    }

    /// Create a TLS connector for outbound connections
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }

    /// Create a TLS acceptor for inbound connections
    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.server_config.clone().map(TlsAcceptor::from)
    }

    /// Open a TCP connection to `peer` (`host:port`) and run the client handshake.
    pub async fn dial(&self, peer: &str) -> Result<TlsStream<TcpStream>, TlsError> {
        let host = match &self.server_name {
            Some(name) => name.clone(),
            None => peer_host(peer).to_string(),
        };
        let domain = ServerName::try_from(host.clone())
            .map_err(|_| TlsError::InvalidServerName(host))?;

        let connector = self.connector();
        let handshake = async {
            let stream = TcpStream::connect(peer).await?;
            stream.set_nodelay(true)?;
            let tls = connector.connect(domain, stream).await?;
            Ok::<_, TlsError>(TlsStream::from(tls))
        };

        tokio::time::timeout(DIAL_TIMEOUT, handshake)
            .await
            .map_err(|_| TlsError::Timeout(peer.to_string()))?
    }
}

/// Host portion of `host:port`, with IPv6 brackets removed
pub fn peer_host(peer: &str) -> &str {
    let host = match peer.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => peer,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn build_client_config(verification: PeerVerification) -> Result<rustls::ClientConfig, TlsError> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(PROTOCOL_VERSIONS)?;

    let mut config = match verification {
        PeerVerification::WebPki { extra_roots } => {
            let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            for cert in extra_roots {
                roots.add(cert)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        PeerVerification::InsecureSkipVerify => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertVerifier {
                algorithms: provider.signature_verification_algorithms,
            }))
            .with_no_client_auth(),
    };

    // Enable session resumption for reconnects
    config.resumption = rustls::client::Resumption::default();
    Ok(config)
}

fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, TlsError> {
    Ok(rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_no_client_auth()
        .with_single_cert(certs, key)?)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate);
    }
    Ok(certs)
}

/// Verifier used only under `PeerVerification::InsecureSkipVerify`.
/// Accepts any certificate chain but still checks handshake signatures so the
/// session keys belong to whoever presented the certificate.
#[derive(Debug)]
struct AcceptAnyCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
