//! Local UDP DNS listener

use super::message::servfail_reply;
use super::TcpDnsClient;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const MAX_UDP_MESSAGE: usize = 4096;

/// Answers UDP queries by forwarding them through a [`TcpDnsClient`]
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    client: Arc<TcpDnsClient>,
}

impl DnsServer {
    pub async fn bind(addr: &str, client: Arc<TcpDnsClient>) -> crate::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            client,
        })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve queries forever
    pub async fn run(self) -> crate::Result<()> {
        info!(
            "DNS server listening on {} (upstream {})",
            self.socket.local_addr()?,
            self.client.upstream()
        );

        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            let query = buf[..n].to_vec();

            let socket = self.socket.clone();
            let client = self.client.clone();
            tokio::spawn(async move {
                let reply = match client.exchange(&query).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        debug!("DNS query from {} failed: {}", peer, e);
                        match servfail_reply(&query) {
                            Some(reply) => reply,
                            None => return,
                        }
                    }
                };
                if let Err(e) = socket.send_to(&reply, peer).await {
                    warn!("Failed to answer {}: {}", peer, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::client::tests::fake_upstream;
    use crate::dns::{build_query, parse_response, RecordType};
    use crate::transport::{TcpDialer, TransportConfig};
    use std::time::Duration;

    #[tokio::test]
    async fn test_forward_udp_query() {
        let upstream = fake_upstream("192.0.2.1").await;
        let client = Arc::new(TcpDnsClient::new(
            Arc::new(TcpDialer::new(TransportConfig::default())),
            upstream,
            Duration::from_secs(5),
        ));
        let server = DnsServer::bind("127.0.0.1:0", client).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = build_query(42, "host.example", RecordType::A).unwrap();
        socket.send_to(&query, server_addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let addrs = parse_response(&buf[..n], 42).unwrap();
        assert_eq!(addrs, vec!["192.0.2.1".parse::<std::net::IpAddr>().unwrap()]);
    }
}
