//! Static port forwarding through the tunnel

use crate::config::PortMap;
use crate::relay::copy_link;
use crate::transport::{Dialer, Network};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Forwards every connection on `listen` to one fixed target
pub struct PortMapper {
    listener: TcpListener,
    target: String,
    dialer: Arc<dyn Dialer>,
}

impl PortMapper {
    pub async fn bind(map: &PortMap, dialer: Arc<dyn Dialer>) -> crate::Result<Self> {
        let listener = TcpListener::bind(&map.listen).await?;
        Ok(Self {
            listener,
            target: map.target.clone(),
            dialer,
        })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> crate::Result<()> {
        info!("Port map {} -> {}", self.listener.local_addr()?, self.target);
        let target: Arc<str> = self.target.into();

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let dialer = self.dialer.clone();
            let target = target.clone();

            tokio::spawn(async move {
                match dialer.dial(Network::Tcp, &target).await {
                    Ok(conn) => {
                        debug!("Port map {} -> {}", peer_addr, target);
                        copy_link(stream, conn).await;
                    }
                    Err(e) => warn!("Port map dial to {} failed: {}", target, e),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TcpDialer, TransportConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_forwards_to_target() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = target.accept().await.unwrap();
            sock.write_all(b"banner").await.unwrap();
        });

        let map = PortMap {
            listen: "127.0.0.1:0".to_string(),
            target: target_addr.to_string(),
        };
        let mapper = PortMapper::bind(&map, Arc::new(TcpDialer::new(TransportConfig::default())))
            .await
            .unwrap();
        let addr = mapper.local_addr().unwrap();
        tokio::spawn(mapper.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"banner");
    }
}
