//! DNS over the tunnel
//!
//! - [`TcpDnsClient`] sends length-framed DNS messages to an upstream server
//!   through any [`Dialer`](crate::Dialer), normally the tunnel pool
//! - [`DnsServer`] is a local UDP listener forwarding through that client
//! - [`Resolver`] abstracts name resolution for the routing filter

mod client;
mod message;
mod server;

pub use client::TcpDnsClient;
pub use message::{build_query, parse_response, servfail_reply, RecordType};
pub use server::DnsServer;

use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;
use tracing::trace;

/// DNS errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("Malformed DNS message: {0}")]
    Malformed(String),

    #[error("Server returned RCODE {0}")]
    Rcode(u8),

    #[error("Transaction ID mismatch")]
    IdMismatch,

    #[error("No address records for {0}")]
    NoRecords(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Query timed out")]
    Timeout,
}

/// Hostname to address resolution
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> crate::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> crate::Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await?
            .map(|addr| addr.ip())
            .collect();
        trace!("System resolver: {} -> {:?}", host, addrs);

        if addrs.is_empty() {
            return Err(DnsError::NoRecords(host.to_string()).into());
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_resolver_literal() {
        let addrs = SystemResolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_system_resolver_localhost() {
        let addrs = SystemResolver.resolve("localhost").await.unwrap();
        assert!(addrs.iter().all(|ip| ip.is_loopback()));
    }
}
