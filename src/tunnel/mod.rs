//! Tunnel layer - multiplexed streams over one encrypted connection
//!
//! Provides:
//! - Frame encoding/decoding
//! - Sessions (credential handshake, stream multiplexing, keepalive)
//! - Per-stream flow control
//! - Session creators used by the pool, and the server side

mod creator;
mod frame;
mod server;
mod session;
mod stream;

pub use creator::{SessionCreator, TunnelClientCreator};
pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_DATA_SIZE};
pub use server::TunnelServer;
pub use session::{IncomingStream, Role, Session, SessionConfig, MAX_MISSED_PONGS};
pub use stream::TunnelStream;

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream rejected by peer: {0}")]
    StreamRejected(String),

    #[error("Flow control violation on stream {0}")]
    FlowControl(u32),

    #[error("Session has reached its stream limit")]
    SessionFull,

    #[error("Session closed")]
    SessionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether another session may succeed where this one failed
    pub fn is_session_unavailable(&self) -> bool {
        matches!(self, TunnelError::SessionFull | TunnelError::SessionClosed)
    }
}

/// Default window size for flow control (256 KB)
pub const DEFAULT_WINDOW_SIZE: u32 = 262144;
