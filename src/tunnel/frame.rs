//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+
//! |  Type  |          Stream ID (4B)           |   Length (2B)   |
//! +--------+--------+--------+--------+--------+--------+--------+
//! |                          Payload                             |
//! +--------+--------+--------+--------+--------+--------+--------+
//! ```

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 7;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Largest payload a stream puts into one data frame
pub const MAX_DATA_SIZE: usize = 16 * 1024;

const RESULT_OK: u8 = 0x00;
const RESULT_FAILED: u8 = 0x01;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Data frame
    Data = 0x00,
    /// Stream open request carrying the destination
    StreamOpen = 0x01,
    /// Reply to a stream open
    StreamResult = 0x02,
    /// Sender will write no more on this stream
    StreamClose = 0x03,
    /// Window update (flow control)
    WindowUpdate = 0x04,
    /// Ping (keepalive)
    Ping = 0x05,
    /// Pong (keepalive response)
    Pong = 0x06,
    /// Go away (connection closing)
    GoAway = 0x07,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::StreamOpen),
            0x02 => Ok(FrameType::StreamResult),
            0x03 => Ok(FrameType::StreamClose),
            0x04 => Ok(FrameType::WindowUpdate),
            0x05 => Ok(FrameType::Ping),
            0x06 => Ok(FrameType::Pong),
            0x07 => Ok(FrameType::GoAway),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID (0 for connection-level frames)
    pub stream_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    fn new(frame_type: FrameType, stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type,
            stream_id,
            payload,
        }
    }

    /// Create a new data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, payload)
    }

    /// Create a stream open frame
    pub fn stream_open(stream_id: u32, destination: &str) -> Self {
        Self::new(
            FrameType::StreamOpen,
            stream_id,
            Bytes::copy_from_slice(destination.as_bytes()),
        )
    }

    /// Create a stream result frame; `Err` carries the reason shown to the opener
    pub fn stream_result(stream_id: u32, result: Result<(), &str>) -> Self {
        let mut payload = BytesMut::new();
        match result {
            Ok(()) => payload.put_u8(RESULT_OK),
            Err(msg) => {
                payload.put_u8(RESULT_FAILED);
                let msg = msg.as_bytes();
                payload.put_slice(&msg[..msg.len().min(MAX_PAYLOAD_SIZE - 1)]);
            }
        }
        Self::new(FrameType::StreamResult, stream_id, payload.freeze())
    }

    /// Create a stream close frame
    pub fn stream_close(stream_id: u32) -> Self {
        Self::new(FrameType::StreamClose, stream_id, Bytes::new())
    }

    /// Create a window update frame
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self::new(FrameType::WindowUpdate, stream_id, payload.freeze())
    }

    /// Create a ping frame
    pub fn ping(data: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(data);
        Self::new(FrameType::Ping, 0, payload.freeze())
    }

    /// Create a pong frame
    pub fn pong(data: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(data);
        Self::new(FrameType::Pong, 0, payload.freeze())
    }

    /// Create a go-away frame
    pub fn go_away() -> Self {
        Self::new(FrameType::GoAway, 0, Bytes::new())
    }

    /// Destination carried by a stream open frame
    pub fn destination(&self) -> Result<&str, TunnelError> {
        std::str::from_utf8(&self.payload)
            .map_err(|_| TunnelError::InvalidFrame("destination is not UTF-8".to_string()))
    }

    /// Outcome carried by a stream result frame
    pub fn open_result(&self) -> Result<(), TunnelError> {
        match self.payload.first() {
            Some(&RESULT_OK) => Ok(()),
            Some(_) => Err(TunnelError::StreamRejected(
                String::from_utf8_lossy(&self.payload[1..]).to_string(),
            )),
            None => Err(TunnelError::InvalidFrame("empty stream result".to_string())),
        }
    }

    /// Increment carried by a window update
    pub fn increment(&self) -> Result<u32, TunnelError> {
        let mut payload = &self.payload[..];
        if payload.len() != 4 {
            return Err(TunnelError::InvalidFrame("bad window update".to_string()));
        }
        Ok(payload.get_u32())
    }

    /// Opaque value carried by ping/pong
    pub fn ping_data(&self) -> Result<u64, TunnelError> {
        let mut payload = &self.payload[..];
        if payload.len() != 8 {
            return Err(TunnelError::InvalidFrame("bad ping payload".to_string()));
        }
        Ok(payload.get_u64())
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), TunnelError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(self.payload.len(), MAX_PAYLOAD_SIZE));
        }
        buf.reserve(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    fn parse_header(header: &[u8]) -> Result<(FrameType, u32, usize), TunnelError> {
        let frame_type = FrameType::try_from(header[0])?;
        let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let len = u16::from_be_bytes([header[5], header[6]]) as usize;
        Ok((frame_type, stream_id, len))
    }

    /// Decode frame from bytes; `None` until a whole frame is buffered
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let (frame_type, stream_id, len) = Self::parse_header(&buf[..FRAME_HEADER_SIZE])?;
        if buf.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Self::new(frame_type, stream_id, payload)))
    }

    /// Read exactly one frame from `reader`
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, TunnelError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header).await?;
        let (frame_type, stream_id, len) = Self::parse_header(&header)?;

        let mut payload = BytesMut::zeroed(len);
        reader.read_exact(&mut payload).await?;
        Ok(Self::new(frame_type, stream_id, payload.freeze()))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}
