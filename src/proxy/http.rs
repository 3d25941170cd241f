//! HTTP proxy: CONNECT tunnels and absolute-URI forwarding

use super::{Address, ProxyError};
use crate::relay::copy_link;
use crate::transport::{Dialer, Network};
use base64::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Request heads larger than this are refused
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Parsed request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Head for the origin server: origin-form target, no proxy or hop-by-hop headers
    fn to_origin_form(&self, path: &str) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", self.method, path, self.version);
        for (key, value) in &self.headers {
            let lower = key.to_ascii_lowercase();
            if lower.starts_with("proxy-") || lower == "connection" || lower == "keep-alive" {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", key, value));
        }
        // one request per dialed connection
        head.push_str("Connection: close\r\n\r\n");
        head.into_bytes()
    }
}

async fn read_head<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<RequestHead, ProxyError> {
    let mut total = 0;
    let mut line = String::new();

    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(ProxyError::InvalidRequest("empty request".to_string()));
    }
    total += n;

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ProxyError::InvalidRequest(format!("bad request line '{}'", line.trim())));
    };
    let mut head = RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers: Vec::new(),
    };

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        total += n;
        if n == 0 || total > MAX_HEAD_SIZE {
            return Err(ProxyError::InvalidRequest("incomplete request head".to_string()));
        }

        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            head.headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(head)
}

/// Split `http://host[:port]/path` into the destination and origin-form path
fn parse_absolute_uri(target: &str) -> Result<(Address, String), ProxyError> {
    let invalid = || ProxyError::InvalidAddress(target.to_string());

    let rest = target
        .get(..7)
        .filter(|scheme| scheme.eq_ignore_ascii_case("http://"))
        .map(|_| &target[7..])
        .ok_or_else(invalid)?;
    let (authority, path) = match rest.find(['/', '?']) {
        Some(i) if rest[i..].starts_with('/') => (&rest[..i], rest[i..].to_string()),
        Some(i) => (&rest[..i], format!("/{}", &rest[i..])),
        None => (rest, "/".to_string()),
    };
    // drop userinfo
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let address = match Address::parse(authority) {
        Ok(address) => address,
        Err(_) => Address::from_host(authority, 80).ok_or_else(invalid)?,
    };
    Ok((address, path))
}

fn authorized(head: &RequestHead, expected: &(String, String)) -> bool {
    let Some(encoded) = head
        .header("proxy-authorization")
        .and_then(|value| value.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    match String::from_utf8(decoded) {
        Ok(credentials) => credentials
            .split_once(':')
            .is_some_and(|(user, pass)| user == expected.0 && pass == expected.1),
        Err(_) => false,
    }
}

/// Status line reported for a failed dial
fn dial_failure_status(err: &crate::Error) -> &'static [u8] {
    if err.is_blocked() {
        b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n"
    } else {
        b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n"
    }
}

/// HTTP proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
    dialer: Arc<dyn Dialer>,
    /// Optional basic authentication (username:password)
    auth: Option<(String, String)>,
}

impl HttpProxyServer {
    /// Bind an HTTP proxy listener that dials through `dialer`
    pub async fn bind(addr: &str, dialer: Arc<dyn Dialer>) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dialer,
            auth: None,
        })
    }

    /// Enable basic authentication
    pub fn with_auth(mut self, username: String, password: String) -> Self {
        self.auth = Some((username, password));
        self
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and handle incoming connections
    pub async fn run(self) -> crate::Result<()> {
        info!("HTTP proxy listening on {}", self.listener.local_addr()?);
        let auth = Arc::new(self.auth);

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New HTTP proxy connection from {}", peer_addr);

            let dialer = self.dialer.clone();
            let auth = auth.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, Option::as_ref(&*auth), dialer).await {
                    debug!("HTTP proxy connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    auth: Option<&(String, String)>,
    dialer: Arc<dyn Dialer>,
) -> crate::Result<()> {
    let mut reader = BufReader::new(stream);
    let head = match read_head(&mut reader).await {
        Ok(head) => head,
        Err(e) => {
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                .await?;
            return Err(e.into());
        }
    };

    if let Some(expected) = auth {
        if !authorized(&head, expected) {
            reader
                .get_mut()
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"tunnelmux\"\r\n\
                      Content-Length: 0\r\n\r\n",
                )
                .await?;
            return Err(ProxyError::AuthenticationFailed.into());
        }
    }

    let connect = head.method.eq_ignore_ascii_case("CONNECT");
    let parsed = if connect {
        Address::parse(&head.target).map(|address| (address, None))
    } else {
        parse_absolute_uri(&head.target).map(|(address, path)| (address, Some(path)))
    };
    let (address, path) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                .await?;
            return Err(e.into());
        }
    };
    debug!("HTTP {} to {}", head.method, address);

    let mut conn = match dialer.dial(Network::Tcp, &address.to_string()).await {
        Ok(conn) => conn,
        Err(e) => {
            reader.get_mut().write_all(dial_failure_status(&e)).await?;
            return Err(e);
        }
    };

    match path {
        None => {
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
        }
        Some(path) => {
            conn.write_all(&head.to_origin_form(&path)).await?;
            conn.flush().await?;
        }
    }

    // the reader may already hold request body bytes
    copy_link(reader, conn).await;
    Ok(())
}
