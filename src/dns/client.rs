//! DNS over TCP through a dialer

use super::message::{build_query, parse_response, RecordType};
use super::{DnsError, Resolver};
use crate::transport::{Dialer, Network};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

/// Sends DNS messages to `upstream` over length-framed TCP
pub struct TcpDnsClient {
    dialer: Arc<dyn Dialer>,
    upstream: String,
    timeout: Duration,
    next_id: AtomicU16,
}

impl TcpDnsClient {
    pub fn new(dialer: Arc<dyn Dialer>, upstream: impl Into<String>, timeout: Duration) -> Self {
        Self {
            dialer,
            upstream: upstream.into(),
            timeout,
            next_id: AtomicU16::new(rand::random()),
        }
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Forward one raw DNS message and return the raw reply
    pub async fn exchange(&self, query: &[u8]) -> crate::Result<Vec<u8>> {
        let len = u16::try_from(query.len())
            .map_err(|_| DnsError::Malformed("query too large".to_string()))?;

        let round_trip = async {
            let mut conn = self.dialer.dial(Network::Tcp, &self.upstream).await?;

            let mut request = Vec::with_capacity(query.len() + 2);
            request.extend_from_slice(&len.to_be_bytes());
            request.extend_from_slice(query);
            conn.write_all(&request).await?;
            conn.flush().await?;

            let reply_len = conn.read_u16().await? as usize;
            let mut reply = vec![0u8; reply_len];
            conn.read_exact(&mut reply).await?;
            Ok::<_, crate::Error>(reply)
        };

        tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| DnsError::Timeout)?
    }

    async fn query(&self, host: &str, qtype: RecordType) -> crate::Result<Vec<IpAddr>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let packet = build_query(id, host, qtype)?;
        let reply = self.exchange(&packet).await?;
        let addrs = parse_response(&reply, id)?;
        trace!("{:?} {} via {}: {:?}", qtype, host, self.upstream, addrs);
        Ok(addrs)
    }
}

#[async_trait]
impl Resolver for TcpDnsClient {
    async fn resolve(&self, host: &str) -> crate::Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        match self.query(host, RecordType::A).await {
            Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
            Ok(_) => {}
            Err(e) => debug!("A lookup for {} failed: {}", host, e),
        }

        let addrs = self.query(host, RecordType::AAAA).await?;
        if addrs.is_empty() {
            return Err(DnsError::NoRecords(host.to_string()).into());
        }
        Ok(addrs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dns::message::tests::answer;
    use crate::transport::{TcpDialer, TransportConfig};
    use tokio::net::TcpListener;

    /// Loopback DNS-over-TCP server answering every A query with `v4`
    pub(crate) async fn fake_upstream(v4: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let len = stream.read_u16().await.unwrap() as usize;
                    let mut query = vec![0u8; len];
                    stream.read_exact(&mut query).await.unwrap();

                    let qtype = u16::from_be_bytes([query[len - 4], query[len - 3]]);
                    let addrs: Vec<IpAddr> = if qtype == RecordType::A as u16 {
                        vec![v4.parse().unwrap()]
                    } else {
                        Vec::new()
                    };
                    let reply = answer(&query, &addrs);
                    stream.write_u16(reply.len() as u16).await.unwrap();
                    stream.write_all(&reply).await.unwrap();
                });
            }
        });

        addr
    }

    fn client(upstream: String) -> TcpDnsClient {
        TcpDnsClient::new(
            Arc::new(TcpDialer::new(TransportConfig::default())),
            upstream,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_resolve_through_dialer() {
        let upstream = fake_upstream("10.9.8.7").await;
        let client = client(upstream);

        let addrs = client.resolve("internal.example").await.unwrap();
        assert_eq!(addrs, vec!["10.9.8.7".parse::<IpAddr>().unwrap()]);

        // literals never hit the network
        let addrs = client.resolve("::1").await.unwrap();
        assert_eq!(addrs, vec!["::1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_exchange_upstream_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap().to_string();
        drop(listener);

        let query = build_query(1, "example.com", RecordType::A).unwrap();
        assert!(client(upstream).exchange(&query).await.is_err());
    }
}
