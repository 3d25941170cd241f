//! Protocol definitions and constants
//!
//! The tunnel handshake is a single request/reply exchange sent right after
//! the encrypted transport is established:
//!
//! ```text
//! request:  MAGIC(4) | version(1) | ulen(1) | username | plen(1) | password
//! reply:    MAGIC(4) | status(1)
//! ```

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Credentials rejected")]
    BadCredentials,

    #[error("Unknown handshake status: {0}")]
    UnknownStatus(u8),

    #[error("Field too long: {0} bytes")]
    FieldTooLong(usize),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Protocol magic bytes
pub const MAGIC: [u8; 4] = [0x54, 0x4D, 0x55, 0x58]; // "TMUX"

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (64 KB)
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Handshake timeout in seconds
pub const HANDSHAKE_TIMEOUT: u64 = 30;

/// Idle timeout in seconds
pub const IDLE_TIMEOUT: u64 = 300;

/// Keepalive interval in seconds
pub const KEEPALIVE_INTERVAL: u64 = 30;

/// Handshake reply status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeStatus {
    Ok = 0x00,
    BadCredentials = 0x01,
    BadVersion = 0x02,
}

impl TryFrom<u8> for HandshakeStatus {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(HandshakeStatus::Ok),
            0x01 => Ok(HandshakeStatus::BadCredentials),
            0x02 => Ok(HandshakeStatus::BadVersion),
            _ => Err(ProtocolError::UnknownStatus(value)),
        }
    }
}

/// Credentials presented by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Encode the handshake request
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let user = self.username.as_bytes();
        let pass = self.password.as_bytes();
        if user.len() > u8::MAX as usize {
            return Err(ProtocolError::FieldTooLong(user.len()));
        }
        if pass.len() > u8::MAX as usize {
            return Err(ProtocolError::FieldTooLong(pass.len()));
        }

        let mut buf = BytesMut::with_capacity(MAGIC.len() + 3 + user.len() + pass.len());
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(user.len() as u8);
        buf.put_slice(user);
        buf.put_u8(pass.len() as u8);
        buf.put_slice(pass);
        Ok(buf)
    }
}

/// Client side: send credentials and wait for the reply
pub async fn client_handshake<S>(stream: &mut S, credentials: &Credentials) -> Result<(), crate::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = credentials.encode()?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).await?;
    if reply[..4] != MAGIC {
        return Err(ProtocolError::InvalidMagic.into());
    }

    match HandshakeStatus::try_from(reply[4])? {
        HandshakeStatus::Ok => Ok(()),
        HandshakeStatus::BadCredentials => Err(ProtocolError::BadCredentials.into()),
        HandshakeStatus::BadVersion => Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: 0,
        }
        .into()),
    }
}

/// Server side: read the client's credentials
pub async fn read_credentials<S>(stream: &mut S) -> Result<Credentials, crate::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await?;
    if header[..4] != MAGIC {
        return Err(ProtocolError::InvalidMagic.into());
    }
    if header[4] != PROTOCOL_VERSION {
        write_status(stream, HandshakeStatus::BadVersion).await?;
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: header[4],
        }
        .into());
    }

    let mut user = vec![0u8; header[5] as usize];
    stream.read_exact(&mut user).await?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut pass = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut pass).await?;

    Ok(Credentials {
        username: String::from_utf8_lossy(&user).to_string(),
        password: String::from_utf8_lossy(&pass).to_string(),
    })
}

/// Server side: send the handshake reply
pub async fn write_status<S>(stream: &mut S, status: HandshakeStatus) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = [0u8; 5];
    reply[..4].copy_from_slice(&MAGIC);
    reply[4] = status as u8;
    stream.write_all(&reply).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_accepts() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            let creds = read_credentials(&mut server).await.unwrap();
            write_status(&mut server, HandshakeStatus::Ok).await.unwrap();
            creds
        });

        client_handshake(&mut client, &Credentials::new("alice", "secret"))
            .await
            .unwrap();
        let creds = server_task.await.unwrap();
        assert_eq!(creds, Credentials::new("alice", "secret"));
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = read_credentials(&mut server).await.unwrap();
            write_status(&mut server, HandshakeStatus::BadCredentials)
                .await
                .unwrap();
        });

        let err = client_handshake(&mut client, &Credentials::new("alice", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Protocol(ProtocolError::BadCredentials)
        ));
    }

    #[tokio::test]
    async fn test_garbage_reply_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = server.read(&mut buf).await;
            server.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x00]).await.unwrap();
        });

        let err = client_handshake(&mut client, &Credentials::new("a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Protocol(ProtocolError::InvalidMagic)));
    }

    #[test]
    fn test_field_too_long() {
        let creds = Credentials::new("x".repeat(300), "p");
        assert!(matches!(creds.encode(), Err(ProtocolError::FieldTooLong(300))));
    }
}
