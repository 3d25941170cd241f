//! Transport layer implementations
//!
//! Defines the [`Dialer`] capability shared by every layer of the stack and
//! provides the leaf implementations:
//! - TCP (plain, also used for direct routes)
//! - An always-failing dialer for prohibited routes
//! - TLS with optional client certificates
//! - Pre-shared key cipher streams

mod cipher;
mod tcp;

#[cfg(feature = "tls")]
mod tls;

pub use cipher::{CipherDialer, CipherStream, MAX_CHUNK_SIZE};
pub use tcp::{FalseDialer, TcpDialer};

#[cfg(feature = "tls")]
pub use tls::{load_certs, load_private_key, tls_client_config, tls_server_config, TlsDialer};

use crate::config::{CryptMode, ServerDefine, Timeouts};
use crate::crypto::{derive_master_key, CipherKind, KEY_LEN};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// A duplex byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A connection produced by a [`Dialer`]; dropping it closes it
pub type Connection = Box<dyn AsyncStream>;

/// Network kind requested from a dialer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// TCP over any address family
    Tcp,
    /// TCP over IPv4 only
    Tcp4,
    /// TCP over IPv6 only
    Tcp6,
}

impl FromStr for Network {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(TransportError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        };
        f.write_str(name)
    }
}

/// Open an outbound connection to `addr` (`host:port`).
///
/// Implementations may be stateless (TCP), wrap another dialer (TLS, cipher,
/// routing filter) or manage shared state (connection pool).
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: Network, addr: &str) -> crate::Result<Connection>;
}

#[async_trait]
impl<D: Dialer + ?Sized> Dialer for Arc<D> {
    async fn dial(&self, network: Network, addr: &str) -> crate::Result<Connection> {
        (**self).dial(network, addr).await
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// TLS / cipher / tunnel handshake timeout
    pub handshake_timeout: Duration,
    /// Disable Nagle on dialed sockets
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(crate::protocol::HANDSHAKE_TIMEOUT),
            nodelay: true,
        }
    }
}

impl From<&Timeouts> for TransportConfig {
    fn from(t: &Timeouts) -> Self {
        Self {
            connect_timeout: t.connect(),
            handshake_timeout: t.handshake(),
            nodelay: true,
        }
    }
}

/// Wrap `base` with the encryption configured for `server`
pub fn encrypted_dialer(
    server: &ServerDefine,
    base: Arc<dyn Dialer>,
    config: &TransportConfig,
) -> crate::Result<Arc<dyn Dialer>> {
    match server.crypt_mode()? {
        #[cfg(feature = "tls")]
        CryptMode::Tls => {
            let client_auth = match (&server.cert_file, &server.cert_key_file) {
                (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
                _ => None,
            };
            let tls_config = tls_client_config(server.root_cas.as_deref(), client_auth)?;
            Ok(Arc::new(TlsDialer::new(
                base,
                Arc::new(tls_config),
                server.server_name.clone(),
                config.handshake_timeout,
            )))
        }
        #[cfg(not(feature = "tls"))]
        CryptMode::Tls => Err(TransportError::Tls("built without tls support".to_string()).into()),
        CryptMode::Cipher(name) => Ok(Arc::new(CipherDialer::new(base, &name, &server.key)?)),
    }
}

/// Server-side counterpart of the encrypted transport
#[derive(Clone)]
pub enum ServerTransport {
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::TlsAcceptor),
    Cipher {
        kind: CipherKind,
        master: [u8; KEY_LEN],
    },
}

impl ServerTransport {
    /// Build from the server section of the configuration
    pub fn from_config(config: &crate::config::ServerConfig) -> crate::Result<Self> {
        match config.crypt_mode()? {
            #[cfg(feature = "tls")]
            CryptMode::Tls => {
                let cert = config.cert_file.as_deref().unwrap_or_default();
                let key = config.cert_key_file.as_deref().unwrap_or_default();
                let tls_config = tls_server_config(cert, key, config.root_cas.as_deref())?;
                Ok(ServerTransport::Tls(tokio_rustls::TlsAcceptor::from(Arc::new(
                    tls_config,
                ))))
            }
            #[cfg(not(feature = "tls"))]
            CryptMode::Tls => Err(TransportError::Tls("built without tls support".to_string()).into()),
            CryptMode::Cipher(name) => Ok(ServerTransport::Cipher {
                kind: CipherKind::from_name(&name)?,
                master: derive_master_key(&config.key)?,
            }),
        }
    }

    /// Wrap an accepted socket
    pub async fn accept(&self, stream: TcpStream) -> crate::Result<Connection> {
        stream.set_nodelay(true).ok();
        match self {
            #[cfg(feature = "tls")]
            ServerTransport::Tls(acceptor) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                Ok(Box::new(tls))
            }
            ServerTransport::Cipher { kind, master } => {
                Ok(Box::new(CipherStream::new(stream, *kind, master)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parse() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("tcp4".parse::<Network>().unwrap(), Network::Tcp4);
        assert_eq!(Network::Tcp6.to_string(), "tcp6");
        assert!("udp".parse::<Network>().is_err());
    }
}
