//! Bidirectional relay between two connections
//!
//! Both directions run inside one future; when either direction reaches
//! end-of-stream or fails, the other is cancelled and both connections are
//! dropped, so nothing outlives the call.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

const BUF_SIZE: usize = 16 * 1024;

/// Bytes moved by [`copy_link`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// From the first connection to the second
    pub a_to_b: u64,
    /// From the second connection to the first
    pub b_to_a: u64,
}

/// Copy bytes both ways between `a` and `b` until one direction finishes,
/// then close both.
pub async fn copy_link<A, B>(a: A, b: B) -> LinkStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let mut stats = LinkStats::default();

    let outcome = tokio::select! {
        r = pipe(a_read, b_write, &mut stats.a_to_b) => ("a->b", r),
        r = pipe(b_read, a_write, &mut stats.b_to_a) => ("b->a", r),
    };

    match outcome {
        (dir, Ok(())) => trace!("Relay finished ({} reached end of stream)", dir),
        (dir, Err(e)) => debug!("Relay finished ({} failed: {})", dir, e),
    }
    debug!("Relayed {} / {} bytes", stats.a_to_b, stats.b_to_a);
    stats
}

async fn pipe<R, W>(mut reader: R, mut writer: W, counter: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *counter += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_echo_through_relay() {
        // destination: echo server
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = echo.accept().await.unwrap();
            let (mut rd, mut wr) = sock.split();
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });

        // front: accept one client and relay it to the echo server
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let relay = tokio::spawn(async move {
            let (client, _) = front.accept().await.unwrap();
            let dest = TcpStream::connect(echo_addr).await.unwrap();
            copy_link(client, dest).await
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        let payload = vec![0x5Au8; 100_000];
        let expected = payload.len();

        let (mut rd, mut wr) = client.split();
        let writer = async {
            wr.write_all(&payload).await.unwrap();
        };
        let reader = async {
            let mut got = vec![0u8; expected];
            rd.read_exact(&mut got).await.unwrap();
            got
        };
        let (_, got) = tokio::join!(writer, reader);
        assert_eq!(got.len(), expected);
        assert!(got.iter().all(|&b| b == 0x5A));

        drop(client);
        let stats = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.a_to_b, expected as u64);
        assert_eq!(stats.b_to_a, expected as u64);
    }

    #[tokio::test]
    async fn test_close_propagates_to_other_side() {
        let (client_a, client_b) = tokio::io::duplex(1024);
        let (dest_a, mut dest_b) = tokio::io::duplex(1024);

        let relay = tokio::spawn(copy_link(client_b, dest_a));
        drop(client_a);

        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();

        // the destination side observes the close
        let mut buf = [0u8; 8];
        let n = dest_b.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
