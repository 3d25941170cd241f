//! Raw TCP dialer (direct routes and the base of every encrypted transport)

use super::{Connection, Dialer, Network, TransportConfig, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Plain TCP dialer
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    config: TransportConfig,
}

impl TcpDialer {
    /// Create a new TCP dialer
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Connect and return the concrete stream
    pub async fn connect(&self, network: Network, addr: &str) -> Result<TcpStream, TransportError> {
        let candidates: Vec<SocketAddr> = tokio::time::timeout(
            self.config.connect_timeout,
            tokio::net::lookup_host(addr),
        )
        .await
        .map_err(|_| TransportError::Timeout)??
        .filter(|a| match network {
            Network::Tcp => true,
            Network::Tcp4 => a.is_ipv4(),
            Network::Tcp6 => a.is_ipv6(),
        })
        .collect();

        if candidates.is_empty() {
            return Err(TransportError::ConnectionFailed(format!(
                "no {} address for {}",
                network, addr
            )));
        }

        let mut last_err = None;
        for candidate in candidates {
            trace!("Connecting to {} ({})", candidate, addr);
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(candidate))
                .await
            {
                Ok(Ok(stream)) => {
                    if self.config.nodelay {
                        stream.set_nodelay(true).ok();
                    }
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!("Connect to {} failed: {}", candidate, e);
                    last_err = Some(TransportError::Io(e));
                }
                Err(_) => last_err = Some(TransportError::Timeout),
            }
        }

        Err(last_err.unwrap_or(TransportError::Closed))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: Network, addr: &str) -> crate::Result<Connection> {
        let stream = self.connect(network, addr).await?;
        Ok(Box::new(stream))
    }
}

/// Dialer that refuses every destination (fallback for prohibited routes)
#[derive(Debug, Clone, Copy, Default)]
pub struct FalseDialer;

#[async_trait]
impl Dialer for FalseDialer {
    async fn dial(&self, _network: Network, addr: &str) -> crate::Result<Connection> {
        Err(crate::Error::Blocked(addr.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dialer() {
        // Start a simple echo server
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let dialer = TcpDialer::default();
        let mut conn = dialer.dial(Network::Tcp, &addr.to_string()).await.unwrap();

        let msg = b"Hello, TCP!";
        conn.write_all(msg).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], msg);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_network_family_filter() {
        let dialer = TcpDialer::default();
        let err = dialer.connect(Network::Tcp6, "127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpDialer::default()
            .dial(Network::Tcp, &addr.to_string())
            .await
            .err()
            .unwrap();
        assert!(err.is_refused());
    }

    #[tokio::test]
    async fn test_false_dialer() {
        let err = FalseDialer
            .dial(Network::Tcp, "10.0.0.1:80")
            .await
            .err()
            .unwrap();
        assert!(err.is_blocked());
    }
}
