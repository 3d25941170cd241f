//! Proxy front-ends
//!
//! Each front-end learns a destination through its own protocol, dials it
//! through the shared [`Dialer`](crate::Dialer) and relays:
//! - SOCKS5 (RFC 1928, username/password per RFC 1929)
//! - HTTP CONNECT and absolute-URI forwarding
//! - Transparent NAT redirect
//! - Static port mapping

#[cfg(feature = "socks5")]
mod socks5;

#[cfg(feature = "http-proxy")]
mod http;

mod portmap;
mod transparent;

#[cfg(feature = "socks5")]
pub use socks5::Socks5Server;

#[cfg(feature = "http-proxy")]
pub use http::HttpProxyServer;

pub use portmap::PortMapper;
pub use transparent::{OriginalDst, SocketOriginalDst, TransparentServer};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Parse `host:port`, with `[v6]:port` for IPv6 literals
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        let invalid = || ProxyError::InvalidAddress(target.to_string());
        let (host, port) = crate::config::split_host_port(target).map_err(|_| invalid())?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        Self::from_host(host, port).ok_or_else(invalid)
    }

    /// Build from a bare host and port
    pub fn from_host(host: &str, port: u16) -> Option<Self> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Address::Ipv4(ip.octets(), port),
            Ok(IpAddr::V6(ip)) => Address::Ipv6(ip.octets(), port),
            Err(_) => Address::Domain(host.to_string(), port),
        })
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::Ipv4(v4.ip().octets(), v4.port()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => Address::Ipv4(v4.octets(), v6.port()),
                None => Address::Ipv6(v6.ip().octets(), v6.port()),
            },
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        assert_eq!(
            Address::parse("1.2.3.4:80").unwrap(),
            Address::Ipv4([1, 2, 3, 4], 80)
        );
        assert_eq!(
            Address::parse("example.com:443").unwrap(),
            Address::Domain("example.com".to_string(), 443)
        );
        let v6 = Address::parse("[::1]:8080").unwrap();
        assert_eq!(v6.port(), 8080);
        assert_eq!(v6.to_string(), "[::1]:8080");

        assert!(Address::parse("example.com").is_err());
        assert!(Address::parse("example.com:http").is_err());
        assert!(Address::parse(":80").is_err());
    }

    #[test]
    fn test_from_mapped_socket_addr() {
        let addr: SocketAddr = "[::ffff:10.0.0.1]:22".parse().unwrap();
        assert_eq!(Address::from(addr).to_string(), "10.0.0.1:22");
    }
}
