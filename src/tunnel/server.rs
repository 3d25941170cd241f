//! Tunnel server: the far end of every client session

use super::session::{IncomingStream, Role, Session, SessionConfig};
use super::TunnelError;
use crate::config::ServerConfig;
use crate::protocol::{read_credentials, write_status, Credentials, HandshakeStatus, ProtocolError};
use crate::relay::copy_link;
use crate::transport::{Dialer, Network, ServerTransport, TcpDialer, TransportConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Accepts tunnel connections and serves their streams
pub struct TunnelServer {
    transport: ServerTransport,
    users: HashMap<String, String>,
    dialer: Arc<dyn Dialer>,
    session_config: SessionConfig,
    handshake_timeout: Duration,
}

impl TunnelServer {
    /// Build from the `[server]` section
    pub fn new(config: &ServerConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            transport: ServerTransport::from_config(config)?,
            users: config.users.clone(),
            dialer: Arc::new(TcpDialer::new(TransportConfig::from(&config.timeouts))),
            session_config: SessionConfig {
                keepalive: None,
                ..SessionConfig::from_timeouts(config.max_streams, &config.timeouts)
            },
            handshake_timeout: config.timeouts.handshake(),
        })
    }

    /// Replace the dialer used to reach stream destinations
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Accept connections on `listener` forever
    pub async fn serve(self, listener: TcpListener) -> crate::Result<()> {
        let server = Arc::new(self);
        info!("Tunnel server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("New connection from {}", peer);

            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer).await {
                    debug!("Connection from {} ended: {}", peer, e);
                }
            });
        }
    }

    fn authorized(&self, credentials: &Credentials) -> bool {
        // an empty user table means no authentication
        self.users.is_empty()
            || self.users.get(&credentials.username) == Some(&credentials.password)
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> crate::Result<()> {
        let handshake = async {
            let mut conn = self.transport.accept(stream).await?;
            let credentials = read_credentials(&mut conn).await?;
            Ok::<_, crate::Error>((conn, credentials))
        };
        let (mut conn, credentials) = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| TunnelError::Timeout)??;

        if !self.authorized(&credentials) {
            warn!("Rejected credentials for '{}' from {}", credentials.username, peer);
            write_status(&mut conn, HandshakeStatus::BadCredentials).await?;
            return Err(ProtocolError::BadCredentials.into());
        }
        write_status(&mut conn, HandshakeStatus::Ok).await?;
        info!("Session from {} authenticated as '{}'", peer, credentials.username);

        let (session, mut incoming) =
            Session::spawn(conn, peer.to_string(), Role::Server, self.session_config.clone());

        while let Some(stream) = incoming.recv().await {
            tokio::spawn(serve_stream(self.dialer.clone(), stream));
        }

        debug!("Session {} from {} finished", session.id(), peer);
        Ok(())
    }
}

async fn serve_stream(dialer: Arc<dyn Dialer>, incoming: IncomingStream) {
    let destination = incoming.destination().to_string();

    match dialer.dial(Network::Tcp, &destination).await {
        Ok(target) => {
            let stream = incoming.accept();
            debug!("Stream {} connected to {}", stream.id(), destination);
            copy_link(stream, target).await;
        }
        Err(e) => {
            debug!("Dial to {} failed: {}", destination, e);
            incoming.reject(&e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(users: &[(&str, &str)]) -> TunnelServer {
        let config = ServerConfig {
            key: "secret".to_string(),
            users: users
                .iter()
                .map(|(u, p)| (u.to_string(), p.to_string()))
                .collect(),
            ..ServerConfig::default()
        };
        TunnelServer::new(&config).unwrap()
    }

    #[test]
    fn test_authorization() {
        let open = server(&[]);
        assert!(open.authorized(&Credentials::new("anyone", "anything")));

        let closed = server(&[("alice", "pw")]);
        assert!(closed.authorized(&Credentials::new("alice", "pw")));
        assert!(!closed.authorized(&Credentials::new("alice", "nope")));
        assert!(!closed.authorized(&Credentials::new("bob", "pw")));
    }
}
