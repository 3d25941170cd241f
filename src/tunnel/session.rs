//! Sessions: one authenticated tunnel connection carrying many streams
//!
//! A session owns two background tasks. The reader decodes frames and routes
//! them to streams; the writer drains a frame queue fed by every stream of the
//! session. Client sessions also run a keepalive ticker.

use super::frame::{Frame, FrameType, MAX_DATA_SIZE};
use super::stream::{StreamWindow, TunnelStream};
use super::{TunnelError, DEFAULT_WINDOW_SIZE};
use crate::config::{Timeouts, DEFAULT_MAX_CONN};
use crate::protocol::{self, Credentials, ProtocolError};
use crate::transport::Connection;
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Pings that may go unanswered before a client session is given up
pub const MAX_MISSED_PONGS: u32 = 3;

/// Which end of the tunnel this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens streams
    Client,
    /// Accepts streams
    Server,
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Concurrent streams allowed on this session
    pub max_streams: usize,
    /// Per-stream flow control window
    pub window_size: u32,
    /// Bound on the credential handshake and on stream-open replies
    pub handshake_timeout: Duration,
    /// Close the session after this long without inbound frames
    pub idle_timeout: Duration,
    /// Ping interval (client role only)
    pub keepalive: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_timeouts(DEFAULT_MAX_CONN, &Timeouts::default())
    }
}

impl SessionConfig {
    pub fn from_timeouts(max_streams: usize, timeouts: &Timeouts) -> Self {
        Self {
            max_streams,
            window_size: DEFAULT_WINDOW_SIZE,
            handshake_timeout: timeouts.handshake(),
            idle_timeout: timeouts.idle(),
            keepalive: (timeouts.keepalive > 0).then(|| timeouts.keepalive()),
        }
    }
}

/// Events delivered from the reader task to one stream
#[derive(Debug)]
pub(super) enum StreamEvent {
    Data(bytes::Bytes),
    Close,
    Error(TunnelError),
}

struct StreamSlot {
    events: mpsc::UnboundedSender<StreamEvent>,
    window: Arc<StreamWindow>,
    opened: Option<oneshot::Sender<Result<(), TunnelError>>>,
}

impl StreamSlot {
    fn fail(mut self, error: impl Fn() -> TunnelError) {
        if let Some(opened) = self.opened.take() {
            let _ = opened.send(Err(error()));
        }
        let _ = self.events.send(StreamEvent::Error(error()));
        self.window.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by a session handle, its streams and its tasks
pub(super) struct Shared {
    id: u64,
    peer: String,
    role: Role,
    pub(super) config: SessionConfig,
    streams: Mutex<HashMap<u32, StreamSlot>>,
    next_stream_id: AtomicU32,
    frames: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    idle_since: Mutex<Instant>,
    /// Pings sent since the last pong
    unanswered_pings: AtomicU32,
}

impl Shared {
    /// Queue a frame for the writer; false once the session is closed
    pub(super) fn send_frame(&self, frame: Frame) -> bool {
        !self.closed.load(Ordering::Acquire) && self.frames.send(frame).is_ok()
    }

    pub(super) fn remove_stream(&self, id: u32) {
        let mut streams = lock(&self.streams);
        if streams.remove(&id).is_some() && streams.is_empty() {
            *lock(&self.idle_since) = Instant::now();
        }
    }

    fn insert_stream(
        self: &Arc<Self>,
        streams: &mut HashMap<u32, StreamSlot>,
        id: u32,
        destination: &str,
        opened: Option<oneshot::Sender<Result<(), TunnelError>>>,
    ) -> TunnelStream {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let window = Arc::new(StreamWindow::new(self.config.window_size));
        streams.insert(
            id,
            StreamSlot {
                events: events_tx,
                window: window.clone(),
                opened,
            },
        );
        TunnelStream::new(id, destination.to_string(), self.clone(), events_rx, window)
    }

    fn allocate_id(&self, streams: &HashMap<u32, StreamSlot>) -> u32 {
        // ids wrap; skip 0 and anything still open
        loop {
            let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !streams.contains_key(&id) {
                return id;
            }
        }
    }

    fn shutdown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        let slots: Vec<StreamSlot> = lock(&self.streams).drain().map(|(_, slot)| slot).collect();
        let failed = slots.len();
        for slot in slots {
            slot.fail(|| TunnelError::SessionClosed);
        }
        *lock(&self.idle_since) = Instant::now();

        info!(
            "Session {} ({}) closed: {} ({} streams failed)",
            self.id, self.peer, reason, failed
        );
    }

    fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        accept: &mpsc::UnboundedSender<IncomingStream>,
    ) -> Result<(), TunnelError> {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Data => self.on_data(id, frame.payload),
            FrameType::StreamOpen => self.on_open(&frame, accept),
            FrameType::StreamResult => {
                let opened = lock(&self.streams)
                    .get_mut(&id)
                    .and_then(|slot| slot.opened.take());
                match opened {
                    Some(tx) => {
                        let _ = tx.send(frame.open_result());
                    }
                    None => trace!("Session {}: stray result for stream {}", self.id, id),
                }
            }
            FrameType::StreamClose => {
                if let Some(slot) = lock(&self.streams).get(&id) {
                    let _ = slot.events.send(StreamEvent::Close);
                }
            }
            FrameType::WindowUpdate => {
                let increment = frame.increment()?;
                if let Some(slot) = lock(&self.streams).get(&id) {
                    slot.window.add_credit(increment);
                }
            }
            FrameType::Ping => {
                self.send_frame(Frame::pong(frame.ping_data()?));
            }
            FrameType::Pong => {
                trace!("Session {}: pong", self.id);
                self.unanswered_pings.store(0, Ordering::Release);
            }
            FrameType::GoAway => return Err(TunnelError::SessionClosed),
        }
        Ok(())
    }

    fn on_data(&self, id: u32, payload: bytes::Bytes) {
        let mut streams = lock(&self.streams);
        let Some(slot) = streams.get(&id) else {
            trace!("Session {}: {} bytes for unknown stream {}", self.id, payload.len(), id);
            return;
        };

        if !slot.window.on_receive(payload.len() as u32, self.config.window_size) {
            warn!("Session {}: stream {} overran its window, resetting", self.id, id);
            if let Some(slot) = streams.remove(&id) {
                slot.fail(|| TunnelError::FlowControl(id));
            }
            if streams.is_empty() {
                *lock(&self.idle_since) = Instant::now();
            }
            drop(streams);
            self.send_frame(Frame::stream_close(id));
            return;
        }
        let _ = slot.events.send(StreamEvent::Data(payload));
    }

    fn on_open(
        self: &Arc<Self>,
        frame: &Frame,
        accept: &mpsc::UnboundedSender<IncomingStream>,
    ) {
        let id = frame.stream_id;
        let reject = |reason: &str| {
            debug!("Session {}: rejecting stream {}: {}", self.id, id, reason);
            self.send_frame(Frame::stream_result(id, Err(reason)));
        };

        if self.role == Role::Client {
            return reject("client does not accept streams");
        }
        let destination = match frame.destination() {
            Ok(destination) => destination,
            Err(e) => return reject(&e.to_string()),
        };

        let stream = {
            let mut streams = lock(&self.streams);
            if streams.contains_key(&id) {
                return reject("duplicate stream id");
            }
            if streams.len() >= self.config.max_streams {
                return reject("too many streams");
            }
            self.insert_stream(&mut streams, id, destination, None)
        };

        if let Err(mpsc::error::SendError(incoming)) = accept.send(IncomingStream { stream }) {
            incoming.reject("server is shutting down");
        }
    }
}

/// One tunnel connection; cheap to clone
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Authenticate over an encrypted connection and start a client session
    pub async fn client(
        mut conn: Connection,
        peer: impl Into<String>,
        credentials: &Credentials,
        config: SessionConfig,
    ) -> crate::Result<Self> {
        let handshake = protocol::client_handshake(&mut conn, credentials);
        match tokio::time::timeout(config.handshake_timeout, handshake).await {
            Err(_) => return Err(TunnelError::Timeout.into()),
            Ok(Err(crate::Error::Protocol(e))) => return Err(e.into()),
            // garbage from a mismatched cipher key lands here
            Ok(Err(e)) => return Err(ProtocolError::HandshakeFailed(e.to_string()).into()),
            Ok(Ok(())) => {}
        }

        let (session, _incoming) = Self::spawn(conn, peer, Role::Client, config);
        Ok(session)
    }

    /// Start multiplexing over an already authenticated connection.
    ///
    /// Streams opened by the peer are delivered on the returned receiver
    /// (server role only).
    pub fn spawn(
        conn: Connection,
        peer: impl Into<String>,
        role: Role,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<IncomingStream>) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            role,
            config,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(1),
            frames: frames_tx,
            closed: AtomicBool::new(false),
            shutdown_tx,
            idle_since: Mutex::new(Instant::now()),
            unanswered_pings: AtomicU32::new(0),
        });

        let (reader, writer) = tokio::io::split(conn);
        tokio::spawn(read_loop(
            shared.clone(),
            reader,
            accept_tx,
            shared.shutdown_tx.subscribe(),
        ));
        tokio::spawn(write_loop(
            shared.clone(),
            writer,
            frames_rx,
            shared.shutdown_tx.subscribe(),
        ));
        if role == Role::Client {
            if let Some(period) = shared.config.keepalive {
                tokio::spawn(keepalive_loop(
                    shared.clone(),
                    period,
                    shared.shutdown_tx.subscribe(),
                ));
            }
        }

        debug!("Session {} ({:?}) started with {}", shared.id, role, shared.peer);
        (Self { shared }, accept_rx)
    }

    /// Open a stream to `destination` (`host:port`)
    pub async fn open_stream(&self, destination: &str) -> Result<TunnelStream, TunnelError> {
        let (opened_tx, opened_rx) = oneshot::channel();

        let stream = {
            let mut streams = lock(&self.shared.streams);
            // checked under the lock so shutdown cannot miss this slot
            if self.is_closed() {
                return Err(TunnelError::SessionClosed);
            }
            if streams.len() >= self.shared.config.max_streams {
                return Err(TunnelError::SessionFull);
            }
            let id = self.shared.allocate_id(&streams);
            self.shared
                .insert_stream(&mut streams, id, destination, Some(opened_tx))
        };

        if !self
            .shared
            .send_frame(Frame::stream_open(stream.id(), destination))
        {
            return Err(TunnelError::SessionClosed);
        }

        match tokio::time::timeout(self.shared.config.handshake_timeout, opened_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(
                    "Session {}: stream {} open to {}",
                    self.shared.id,
                    stream.id(),
                    destination
                );
                Ok(stream)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TunnelError::SessionClosed),
            Err(_) => Err(TunnelError::Timeout),
        }
    }

    /// Process-unique session id
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Remote address this session is connected to
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Number of currently open streams
    pub fn open_streams(&self) -> usize {
        lock(&self.shared.streams).len()
    }

    /// Stream limit of this session
    pub fn max_streams(&self) -> usize {
        self.shared.config.max_streams
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// How long the session has carried no streams, `None` while any are open
    pub fn idle_for(&self) -> Option<Duration> {
        if self.open_streams() > 0 {
            return None;
        }
        Some(lock(&self.shared.idle_since).elapsed())
    }

    /// Tell the peer we are going away and fail every open stream
    pub fn close(&self) {
        self.shared.send_frame(Frame::go_away());
        self.shared.shutdown("closed locally");
    }

    /// Wait until the session is closed
    pub async fn closed(&self) {
        let mut shutdown = self.shared.shutdown_tx.subscribe();
        if self.is_closed() {
            return;
        }
        let _ = shutdown.changed().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A stream opened by the peer, waiting to be accepted or rejected
pub struct IncomingStream {
    stream: TunnelStream,
}

impl IncomingStream {
    /// Requested destination
    pub fn destination(&self) -> &str {
        self.stream.destination()
    }

    /// Confirm the open and hand out the stream
    pub fn accept(self) -> TunnelStream {
        self.stream
            .shared()
            .send_frame(Frame::stream_result(self.stream.id(), Ok(())));
        self.stream
    }

    /// Refuse the open with `reason`
    pub fn reject(mut self, reason: &str) {
        self.stream.mark_write_closed();
        self.stream
            .shared()
            .send_frame(Frame::stream_result(self.stream.id(), Err(reason)));
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    reader: ReadHalf<Connection>,
    accept: mpsc::UnboundedSender<IncomingStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(reader);
    let idle = shared.config.idle_timeout;

    let reason = loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break "shutdown".to_string(),
            read = tokio::time::timeout(idle, Frame::read_from(&mut reader)) => match read {
                Err(_) => break "idle timeout".to_string(),
                Ok(Err(e)) => break e.to_string(),
                Ok(Ok(frame)) => frame,
            },
        };
        if let Err(e) = shared.dispatch(frame, &accept) {
            break e.to_string();
        }
    };

    shared.shutdown(&reason);
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: WriteHalf<Connection>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = BytesMut::with_capacity(4 * MAX_DATA_SIZE);

    let result: Result<(), TunnelError> = async {
        loop {
            let frame = tokio::select! {
                biased;
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            buf.clear();
            frame.encode_into(&mut buf)?;
            // coalesce whatever else is already queued
            while buf.len() < 4 * MAX_DATA_SIZE {
                match frames.try_recv() {
                    Ok(frame) => frame.encode_into(&mut buf)?,
                    Err(_) => break,
                }
            }
            writer.write_all(&buf).await?;
            writer.flush().await?;
        }

        // frames queued right before shutdown, e.g. a go-away
        buf.clear();
        while let Ok(frame) = frames.try_recv() {
            frame.encode_into(&mut buf)?;
        }
        writer.write_all(&buf).await?;
        writer.shutdown().await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => shared.shutdown("writer finished"),
        Err(e) => shared.shutdown(&format!("write failed: {}", e)),
    }
}

async fn keepalive_loop(shared: Arc<Shared>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut seq = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if shared.unanswered_pings.fetch_add(1, Ordering::AcqRel) >= MAX_MISSED_PONGS {
                    shared.shutdown("keepalive timeout");
                    break;
                }
                seq = seq.wrapping_add(1);
                if !shared.send_frame(Frame::ping(seq)) {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
