//! TLS transport
//!
//! Client side validates the server against the configured trust roots (or
//! the bundled web PKI roots) and optionally presents a client certificate.
//! Server side can require client certificates signed by its own roots.

use super::{Connection, Dialer, Network, TransportError};
use crate::config::split_host_port;
use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// TLS dialer wrapping a base dialer
pub struct TlsDialer {
    base: Arc<dyn Dialer>,
    connector: TlsConnector,
    server_name: Option<String>,
    timeout: Duration,
}

impl TlsDialer {
    /// Create a new TLS dialer
    pub fn new(
        base: Arc<dyn Dialer>,
        config: Arc<rustls::ClientConfig>,
        server_name: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base,
            connector: TlsConnector::from(config),
            server_name,
            timeout,
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, network: Network, addr: &str) -> crate::Result<Connection> {
        let sni = match &self.server_name {
            Some(name) => name.clone(),
            None => split_host_port(addr)?.0.to_string(),
        };
        let server_name = ServerName::try_from(sni.clone())
            .map_err(|e| TransportError::Tls(format!("Invalid server name '{}': {}", sni, e)))?;

        let raw = self.base.dial(network, addr).await?;

        let tls_stream = tokio::time::timeout(self.timeout, self.connector.connect(server_name, raw))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        debug!("TLS handshake complete with {} (SNI: {})", addr, sni);
        Ok(Box::new(tls_stream))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load a PEM certificate chain
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("Failed to open cert file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse certs in {}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!("No certificates found in {}", path)));
    }

    info!("Loaded {} certificate(s) from {}", certs.len(), path);
    Ok(certs)
}

/// Load a PEM private key
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("Failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("Failed to parse key in {}: {}", path, e)))?
        .ok_or_else(|| TransportError::Tls(format!("No private key found in {}", path)))
}

fn root_store(path: Option<&str>) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    match path {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("Bad root in {}: {}", path, e)))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

/// Build a client config from optional trust roots and client certificate
pub fn tls_client_config(
    root_cas: Option<&str>,
    client_auth: Option<(&str, &str)>,
) -> Result<rustls::ClientConfig, TransportError> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(root_store(root_cas)?);

    match client_auth {
        Some((cert, key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| TransportError::Tls(e.to_string())),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Build a server config; `client_roots` turns on mandatory client certificates
pub fn tls_server_config(
    cert: &str,
    key: &str,
    client_roots: Option<&str>,
) -> Result<rustls::ServerConfig, TransportError> {
    let builder = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let builder = match client_roots {
        Some(path) => {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(Some(path))?), provider())
                    .build()
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    builder
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| TransportError::Tls(e.to_string()))
}
