//! TLS termination with a certificate chosen per handshake.
//!
//! The listener reads the ClientHello first, asks a [`CertificateSource`]
//! for the server name, then finishes the handshake with a config built
//! around that one certificate. Static files and the ACME manager are both
//! certificate sources.

use async_trait::async_trait;
use rustls::crypto::aws_lc_rs;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info};

/// ALPN protocols offered to clients.
const ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("no certificate found in PEM input")]
    NoCertificate,

    #[error("no private key found in PEM input")]
    NoPrivateKey,

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error("no certificate for {host}: {message}")]
    Unavailable { host: String, message: String },

    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),
}

/// Supplies the certificate for a handshake.
#[async_trait]
pub trait CertificateSource: Send + Sync + std::fmt::Debug {
    /// Certificate for the SNI server name, if the client sent one.
    async fn certificate_for(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, TlsError>;
}

/// Parse a PEM chain and key into a signing-ready certificate.
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, TlsError> {
    let mut reader = cert_pem;
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem(e.to_string()))?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificate);
    }

    let mut reader = key_pem;
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::Pem(e.to_string()))?
        .ok_or(TlsError::NoPrivateKey)?;
    let signing_key = aws_lc_rs::sign::any_supported_type(&key)?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// One certificate for every server name, loaded from disk at startup.
#[derive(Debug, Clone)]
pub struct StaticCertificate {
    key: Arc<CertifiedKey>,
}

impl StaticCertificate {
    pub fn new(key: CertifiedKey) -> Self {
        Self { key: Arc::new(key) }
    }

    pub fn from_files(cert_file: &Path, key_file: &Path) -> Result<Self, TlsError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|source| TlsError::Io {
                path: path.to_path_buf(),
                source,
            })
        };
        let key = certified_key_from_pem(&read(cert_file)?, &read(key_file)?)?;
        info!(cert_file = %cert_file.display(), "Loaded static TLS certificate");
        Ok(Self::new(key))
    }
}

#[async_trait]
impl CertificateSource for StaticCertificate {
    async fn certificate_for(&self, _server_name: Option<&str>) -> Result<Arc<CertifiedKey>, TlsError> {
        Ok(self.key.clone())
    }
}

/// Resolves every handshake to the certificate picked for it.
#[derive(Debug)]
struct FixedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Server config presenting `key`, offering h2 and HTTP/1.1.
pub fn server_config(key: Arc<CertifiedKey>) -> Result<ServerConfig, TlsError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCertResolver(key)));
    config.alpn_protocols = ALPN.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Complete a server handshake on `stream`.
pub async fn accept<IO>(stream: IO, source: &dyn CertificateSource) -> Result<TlsStream<IO>, TlsError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
        .await
        .map_err(TlsError::Handshake)?;

    let server_name = start.client_hello().server_name().map(str::to_string);
    debug!(server_name = ?server_name, "Received ClientHello");

    let key = source.certificate_for(server_name.as_deref()).await?;
    let config = server_config(key)?;

    start
        .into_stream(Arc::new(config))
        .await
        .map_err(TlsError::Handshake)
}
