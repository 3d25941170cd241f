//! Transparent proxy for NAT-redirected connections
//!
//! The pre-redirect destination is recovered from the kernel's connection
//! tracking table (`SO_ORIGINAL_DST`), then dialed like any other target.

use crate::relay::copy_link;
use crate::transport::{Dialer, Network};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Recovers where an accepted connection was originally headed
pub trait OriginalDst: Send + Sync {
    fn original_dst(&self, stream: &TcpStream) -> io::Result<SocketAddr>;
}

/// Asks the kernel via `getsockopt`
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOriginalDst;

impl OriginalDst for SocketOriginalDst {
    fn original_dst(&self, stream: &TcpStream) -> io::Result<SocketAddr> {
        sys::original_dst(stream)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    use std::os::unix::io::AsRawFd;
    use tokio::net::TcpStream;

    /// From `linux/netfilter_ipv4.h`
    const SO_ORIGINAL_DST: libc::c_int = 80;
    /// From `linux/netfilter_ipv6/ip6_tables.h`
    const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

    pub fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
        let local = stream.local_addr()?;
        let (level, name) = match local {
            SocketAddr::V4(_) => (libc::SOL_IP, SO_ORIGINAL_DST),
            SocketAddr::V6(v6) if v6.ip().to_ipv4_mapped().is_some() => (libc::SOL_IP, SO_ORIGINAL_DST),
            SocketAddr::V6(_) => (libc::SOL_IPV6, IP6T_SO_ORIGINAL_DST),
        };

        // SAFETY: storage is large enough for either address family and len
        // tells the kernel its size.
        let storage = unsafe {
            let mut storage: libc::sockaddr_storage = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let ret = libc::getsockopt(
                stream.as_raw_fd(),
                level,
                name,
                &mut storage as *mut _ as *mut libc::c_void,
                &mut len,
            );
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            storage
        };

        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                // SAFETY: the kernel filled a sockaddr_in
                let addr = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
                Ok(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                    u16::from_be(addr.sin_port),
                )))
            }
            libc::AF_INET6 => {
                // SAFETY: the kernel filled a sockaddr_in6
                let addr = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(addr.sin6_addr.s6_addr),
                    u16::from_be(addr.sin6_port),
                    addr.sin6_flowinfo,
                    addr.sin6_scope_id,
                )))
            }
            family => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected address family {}", family),
            )),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;

    pub fn original_dst(_stream: &TcpStream) -> io::Result<SocketAddr> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transparent proxy needs SO_ORIGINAL_DST (Linux only)",
        ))
    }
}

/// Listener for redirected connections
pub struct TransparentServer {
    listener: TcpListener,
    dialer: Arc<dyn Dialer>,
    original_dst: Arc<dyn OriginalDst>,
}

impl TransparentServer {
    pub async fn bind(addr: &str, dialer: Arc<dyn Dialer>) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dialer,
            original_dst: Arc::new(SocketOriginalDst),
        })
    }

    /// Replace the destination lookup
    pub fn with_original_dst(mut self, original_dst: Arc<dyn OriginalDst>) -> Self {
        self.original_dst = original_dst;
        self
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> crate::Result<()> {
        info!("Transparent proxy listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let dialer = self.dialer.clone();
            let original_dst = self.original_dst.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, original_dst.as_ref(), dialer).await {
                    debug!("Transparent connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    original_dst: &dyn OriginalDst,
    dialer: Arc<dyn Dialer>,
) -> crate::Result<()> {
    let target = original_dst.original_dst(&stream)?;
    // a connection made straight to the listener would loop back to it
    if target == stream.local_addr()? {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "connection was not redirected").into());
    }

    let target = super::Address::from(target).to_string();
    debug!("Transparent connect to {}", target);
    let conn = dialer.dial(Network::Tcp, &target).await?;
    copy_link(stream, conn).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TcpDialer, TransportConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Fixed(io::Result<SocketAddr>);

    impl OriginalDst for Fixed {
        fn original_dst(&self, _stream: &TcpStream) -> io::Result<SocketAddr> {
            match &self.0 {
                Ok(addr) => Ok(*addr),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    async fn start(lookup: Fixed) -> SocketAddr {
        let server = TransparentServer::bind("127.0.0.1:0", Arc::new(TcpDialer::new(TransportConfig::default())))
            .await
            .unwrap()
            .with_original_dst(Arc::new(lookup));
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    #[tokio::test]
    async fn test_relays_to_original_destination() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = echo.accept().await.unwrap();
            let (mut rd, mut wr) = sock.split();
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });

        let proxy = start(Fixed(Ok(echo_addr))).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(b"redirected").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"redirected");
    }

    #[tokio::test]
    async fn test_lookup_failure_closes_connection() {
        let proxy = start(Fixed(Err(io::Error::from(io::ErrorKind::Unsupported)))).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unredirected_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(TcpStream::connect(addr));
        let (stream, _) = listener.accept().await.unwrap();
        let _client = client.await.unwrap().unwrap();

        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(TransportConfig::default()));
        let err = handle_connection(stream, &Fixed(Ok(addr)), dialer).await.unwrap_err();
        assert!(matches!(err, crate::Error::Io(e) if e.kind() == io::ErrorKind::InvalidInput));
    }
}
