//! SOCKS5 proxy implementation (RFC 1928)

use super::{Address, ProxyError};
use crate::relay::copy_link;
use crate::transport::{Dialer, Network};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Username/password subnegotiation version (RFC 1929)
const AUTH_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Reply code reported for a failed dial
    pub fn for_dial_error(err: &crate::Error) -> Self {
        if err.is_blocked() {
            Reply::ConnectionNotAllowed
        } else if err.is_refused() {
            Reply::ConnectionRefused
        } else if err.is_timeout() {
            Reply::TtlExpired
        } else if matches!(err, crate::Error::Pool(_)) {
            // no tunnel could be set up, the destination was never tried
            Reply::GeneralFailure
        } else {
            Reply::HostUnreachable
        }
    }
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
    dialer: Arc<dyn Dialer>,
    /// Optional username/password authentication
    auth: Option<(String, String)>,
}

impl Socks5Server {
    /// Bind a SOCKS5 listener that dials through `dialer`
    pub async fn bind(addr: &str, dialer: Arc<dyn Dialer>) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dialer,
            auth: None,
        })
    }

    /// Enable username/password authentication
    pub fn with_auth(mut self, username: String, password: String) -> Self {
        self.auth = Some((username, password));
        self
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and handle incoming connections
    pub async fn run(self) -> crate::Result<()> {
        info!("SOCKS5 server listening on {}", self.listener.local_addr()?);
        let auth = Arc::new(self.auth);

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New SOCKS5 connection from {}", peer_addr);

            let dialer = self.dialer.clone();
            let auth = auth.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, Option::as_ref(&*auth), dialer).await {
                    debug!("SOCKS5 connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    auth: Option<&(String, String)>,
    dialer: Arc<dyn Dialer>,
) -> crate::Result<()> {
    negotiate(&mut stream, auth).await?;

    let (command, address) = read_request(&mut stream).await?;
    debug!("SOCKS5 {:?} to {}", command, address);

    if command != Command::Connect {
        stream.write_all(&make_reply(Reply::CommandNotSupported)).await?;
        return Err(ProxyError::UnsupportedCommand(command as u8).into());
    }

    let target = address.to_string();
    let conn = match dialer.dial(Network::Tcp, &target).await {
        Ok(conn) => conn,
        Err(e) => {
            stream.write_all(&make_reply(Reply::for_dial_error(&e))).await?;
            return Err(e);
        }
    };

    stream.write_all(&make_reply(Reply::Succeeded)).await?;
    copy_link(stream, conn).await;
    Ok(())
}

/// Method selection and optional RFC 1929 subnegotiation
async fn negotiate(stream: &mut TcpStream, auth: Option<&(String, String)>) -> Result<(), ProxyError> {
    let mut buf = [0u8; 255];
    stream.read_exact(&mut buf[..2]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    let offered = &buf[..nmethods];

    let method = match auth {
        Some(_) if offered.contains(&(AuthMethod::UsernamePassword as u8)) => {
            AuthMethod::UsernamePassword
        }
        None if offered.contains(&(AuthMethod::NoAuth as u8)) => AuthMethod::NoAuth,
        _ => AuthMethod::NoAcceptable,
    };
    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

    match (method, auth) {
        (AuthMethod::NoAcceptable, _) => Err(ProxyError::AuthenticationFailed),
        (AuthMethod::UsernamePassword, Some((expected_user, expected_pass))) => {
            stream.read_exact(&mut buf[..2]).await?;
            if buf[0] != AUTH_VERSION {
                return Err(ProxyError::InvalidRequest(format!("auth version {}", buf[0])));
            }
            let ulen = buf[1] as usize;
            stream.read_exact(&mut buf[..ulen]).await?;
            let username = String::from_utf8_lossy(&buf[..ulen]).to_string();

            stream.read_exact(&mut buf[..1]).await?;
            let plen = buf[0] as usize;
            stream.read_exact(&mut buf[..plen]).await?;
            let password = String::from_utf8_lossy(&buf[..plen]).to_string();

            let success = username == *expected_user && password == *expected_pass;
            stream
                .write_all(&[AUTH_VERSION, if success { 0x00 } else { 0x01 }])
                .await?;
            if success {
                Ok(())
            } else {
                Err(ProxyError::AuthenticationFailed)
            }
        }
        _ => Ok(()),
    }
}

async fn read_request(stream: &mut TcpStream) -> Result<(Command, Address), ProxyError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(header[0]));
    }

    // header[2] is reserved
    let command = match Command::try_from(header[1]) {
        Ok(command) => command,
        Err(e) => {
            stream.write_all(&make_reply(Reply::CommandNotSupported)).await?;
            return Err(e);
        }
    };
    let addr_type = match AddressType::try_from(header[3]) {
        Ok(addr_type) => addr_type,
        Err(e) => {
            stream.write_all(&make_reply(Reply::AddressTypeNotSupported)).await?;
            return Err(e);
        }
    };

    let address = match addr_type {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Address::Ipv4(ip, stream.read_u16().await?)
        }
        AddressType::Domain => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| ProxyError::InvalidAddress("non-UTF-8 domain".to_string()))?;
            Address::Domain(domain, stream.read_u16().await?)
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Address::Ipv6(ip, stream.read_u16().await?)
        }
    };

    Ok((command, address))
}

/// Reply with an unspecified bound address
fn make_reply(reply: Reply) -> [u8; 10] {
    [SOCKS_VERSION, reply as u8, 0x00, AddressType::Ipv4 as u8, 0, 0, 0, 0, 0, 0]
}
