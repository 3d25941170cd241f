//! # tunnelmux
//!
//! A client-side proxy that accepts local SOCKS5, HTTP and transparently
//! redirected connections and forwards them to a pool of remote servers over
//! encrypted, multiplexed tunnels.
//!
//! ## Architecture
//!
//! Every layer implements and consumes the same [`Dialer`] capability, so the
//! stack is assembled once at startup by plain wrapping:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Front-ends                      │
//! │   (SOCKS5, HTTP, transparent, port mapper, DNS)     │
//! ├─────────────────────────────────────────────────────┤
//! │                   Routing filter                    │
//! │          (prohibited → direct → tunnel)             │
//! ├─────────────────────────────────────────────────────┤
//! │                  Connection pool                    │
//! │      (warm sessions, capacity scaling, failover)    │
//! ├─────────────────────────────────────────────────────┤
//! │                 Tunnel / multiplexer                │
//! │     (credential handshake, streams, flow control)   │
//! ├─────────────────────────────────────────────────────┤
//! │                Encrypted transport                  │
//! │            (TLS or pre-shared key cipher)           │
//! ├─────────────────────────────────────────────────────┤
//! │                        TCP                          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod dns;
pub mod filter;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use transport::{Connection, Dialer, Network};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("Filter error: {0}")]
    Filter(#[from] filter::FilterError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("DNS error: {0}")]
    Dns(#[from] dns::DnsError),

    #[error("Destination blocked: {0}")]
    Blocked(String),

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Whether the failure was caused by the routing policy rather than the network
    pub fn is_blocked(&self) -> bool {
        matches!(self, Error::Blocked(_))
    }

    /// Whether the failure was a timeout at any layer
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Transport(transport::TransportError::Timeout) => true,
            Error::Tunnel(tunnel::TunnelError::Timeout) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether the destination actively refused the connection
    pub fn is_refused(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::ConnectionRefused,
            Error::Transport(transport::TransportError::Io(e)) => {
                e.kind() == std::io::ErrorKind::ConnectionRefused
            }
            _ => false,
        }
    }
}
