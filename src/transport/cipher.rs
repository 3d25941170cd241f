//! Pre-shared key cipher stream
//!
//! Each direction begins with a random salt; the direction key is derived
//! from the master key and that salt. Payload travels in chunks:
//!
//! ```text
//! salt(16) | seal(len: u16 BE) | seal(payload) | seal(len) | seal(payload) ...
//! ```
//!
//! A peer holding a different key fails to open the first length header, so
//! the mismatch surfaces as an `InvalidData` read error.

use super::{Connection, Dialer, Network};
use crate::crypto::{
    derive_master_key, derive_subkey, generate_salt, Cipher, CipherKind, CryptoError, KEY_LEN,
    SALT_LEN, TAG_LEN,
};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest plaintext carried by one chunk
pub const MAX_CHUNK_SIZE: usize = 16 * 1024;

const HEADER_LEN: usize = 2 + TAG_LEN;
const READ_SIZE: usize = MAX_CHUNK_SIZE + TAG_LEN;

#[derive(Debug, Clone, Copy)]
enum ReadState {
    Salt,
    Header,
    Body(usize),
}

/// Encrypted duplex stream over any byte stream
pub struct CipherStream<S> {
    inner: S,
    kind: CipherKind,
    master: [u8; KEY_LEN],
    reader: Option<Cipher>,
    read_state: ReadState,
    read_buf: BytesMut,
    plaintext: BytesMut,
    read_eof: bool,
    writer: Cipher,
    write_buf: BytesMut,
}

impl<S> CipherStream<S> {
    /// Wrap `inner`; our salt is queued as the first bytes written
    pub fn new(inner: S, kind: CipherKind, master: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let salt = generate_salt()?;
        let writer = Cipher::new(kind, &derive_subkey(master, &salt)?)?;

        let mut write_buf = BytesMut::with_capacity(SALT_LEN + HEADER_LEN + READ_SIZE);
        write_buf.extend_from_slice(&salt);

        Ok(Self {
            inner,
            kind,
            master: *master,
            reader: None,
            read_state: ReadState::Salt,
            read_buf: BytesMut::with_capacity(READ_SIZE),
            plaintext: BytesMut::new(),
            read_eof: false,
            writer,
            write_buf,
        })
    }

    /// Get a reference to the wrapped stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Try to decode one unit (salt, header or body) from `read_buf`
    fn decode(&mut self) -> io::Result<bool> {
        match self.read_state {
            ReadState::Salt => {
                if self.read_buf.len() < SALT_LEN {
                    return Ok(false);
                }
                let salt = self.read_buf.split_to(SALT_LEN);
                let key = derive_subkey(&self.master, &salt)?;
                self.reader = Some(Cipher::new(self.kind, &key)?);
                self.read_state = ReadState::Header;
            }
            ReadState::Header => {
                if self.read_buf.len() < HEADER_LEN {
                    return Ok(false);
                }
                let mut header = self.read_buf.split_to(HEADER_LEN);
                let plain = self.reader()?.open_in_place(&mut header)?;
                let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
                if len > MAX_CHUNK_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("chunk of {} bytes exceeds limit", len),
                    ));
                }
                self.read_state = ReadState::Body(len);
            }
            ReadState::Body(len) => {
                if self.read_buf.len() < len + TAG_LEN {
                    return Ok(false);
                }
                let mut body = self.read_buf.split_to(len + TAG_LEN);
                let n = self.reader()?.open_in_place(&mut body)?.len();
                body.truncate(n);
                self.plaintext = body;
                self.read_state = ReadState::Header;
            }
        }
        Ok(true)
    }

    fn reader(&mut self) -> io::Result<&mut Cipher> {
        self.reader
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing peer salt"))
    }

    fn seal_chunk(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = (payload.len() as u16).to_be_bytes();
        self.writer.seal_append(&len, &mut self.write_buf)?;
        self.writer.seal_append(payload, &mut self.write_buf)?;
        Ok(())
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    /// Write out every pending ciphertext byte
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.write_buf) {
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.plaintext.is_empty() {
                let n = this.plaintext.len().min(buf.remaining());
                buf.put_slice(&this.plaintext[..n]);
                this.plaintext.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }
            if this.decode()? {
                continue;
            }

            let start = this.read_buf.len();
            this.read_buf.resize(start + READ_SIZE, 0);
            let mut chunk = ReadBuf::new(&mut this.read_buf[start..]);
            let polled = Pin::new(&mut this.inner).poll_read(cx, &mut chunk);
            let filled = chunk.filled().len();
            this.read_buf.truncate(start + filled);

            match polled {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) if filled == 0 => {
                    let clean = this.read_buf.is_empty()
                        && matches!(this.read_state, ReadState::Salt | ReadState::Header);
                    if !clean {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "cipher stream truncated mid-chunk",
                        )));
                    }
                    this.read_eof = true;
                }
                Poll::Ready(Ok(())) => {}
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // keep at most one sealed chunk buffered
        if this.poll_drain(cx)?.is_pending() {
            return Poll::Pending;
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_CHUNK_SIZE);
        this.seal_chunk(&buf[..n])?;

        // the chunk is accepted either way; leftovers go out on the next call
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_drain(cx)?.is_pending() {
            return Poll::Pending;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_drain(cx)?.is_pending() {
            return Poll::Pending;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Dialer wrapping a base dialer's connections in a [`CipherStream`]
pub struct CipherDialer {
    base: Arc<dyn Dialer>,
    kind: CipherKind,
    master: [u8; KEY_LEN],
}

impl CipherDialer {
    /// Create a dialer for cipher `name` keyed by the shared secret `key`
    pub fn new(base: Arc<dyn Dialer>, name: &str, key: &str) -> crate::Result<Self> {
        Ok(Self {
            base,
            kind: CipherKind::from_name(name)?,
            master: derive_master_key(key)?,
        })
    }
}

#[async_trait]
impl Dialer for CipherDialer {
    async fn dial(&self, network: Network, addr: &str) -> crate::Result<Connection> {
        let raw = self.base.dial(network, addr).await?;
        Ok(Box::new(CipherStream::new(raw, self.kind, &self.master)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair(
        client_key: &str,
        server_key: &str,
    ) -> (
        CipherStream<tokio::io::DuplexStream>,
        CipherStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let kind = CipherKind::Aes256Gcm;
        let client = CipherStream::new(a, kind, &derive_master_key(client_key).unwrap()).unwrap();
        let server = CipherStream::new(b, kind, &derive_master_key(server_key).unwrap()).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_bidirectional_roundtrip() {
        let (mut client, mut server) = pair("secret", "secret");

        // larger than several chunks
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let echo = tokio::spawn(async move {
            let mut buf = vec![0u8; expected.len()];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, expected);
            server.write_all(b"done").await.unwrap();
            server.flush().await.unwrap();
            server
        });

        client.write_all(&payload).await.unwrap();
        client.flush().await.unwrap();

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"done");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_key_is_invalid_data() {
        let (mut client, mut server) = pair("right", "wrong");

        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 5];
        let err = server.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_clean_close_reads_eof() {
        let (mut client, mut server) = pair("k", "k");

        client.write_all(b"bye").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bye");
    }

    #[tokio::test]
    async fn test_truncated_chunk() {
        let (mut raw, b) = tokio::io::duplex(1024);
        let master = derive_master_key("k").unwrap();
        let mut server = CipherStream::new(b, CipherKind::Aes256Gcm, &master).unwrap();

        // a salt and half a header
        raw.write_all(&[0u8; SALT_LEN + 5]).await.unwrap();
        drop(raw);

        let mut buf = [0u8; 8];
        let err = server.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
