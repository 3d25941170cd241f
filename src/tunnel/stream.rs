//! Multiplexed stream implementation

use super::frame::{Frame, MAX_DATA_SIZE};
use super::session::{Shared, StreamEvent};
use bytes::{Buf, Bytes};
use futures::task::AtomicWaker;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Flow control state of one stream, shared with the session reader
pub(super) struct StreamWindow {
    /// Bytes we may still send before the peer grants more
    send_credit: AtomicU32,
    send_waker: AtomicWaker,
    /// Bytes received and not yet credited back to the peer
    recv_pending: AtomicU32,
    closed: AtomicBool,
}

impl StreamWindow {
    pub(super) fn new(size: u32) -> Self {
        Self {
            send_credit: AtomicU32::new(size),
            send_waker: AtomicWaker::new(),
            recv_pending: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(super) fn add_credit(&self, increment: u32) {
        let _ = self
            .send_credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_add(increment))
            });
        self.send_waker.wake();
    }

    pub(super) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.send_waker.wake();
    }

    /// Account for inbound data; false if the peer overran the window
    pub(super) fn on_receive(&self, len: u32, window: u32) -> bool {
        let pending = self.recv_pending.fetch_add(len, Ordering::AcqRel);
        pending.saturating_add(len) <= window
    }

    fn release(&self, len: u32) {
        self.recv_pending.fetch_sub(len, Ordering::AcqRel);
    }

    /// Take up to `want` bytes of send credit; `None` once the stream is dead
    fn poll_acquire(&self, cx: &mut Context<'_>, want: u32) -> Poll<Option<u32>> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Poll::Ready(None);
            }
            let credit = self.send_credit.load(Ordering::Acquire);
            if credit == 0 {
                self.send_waker.register(cx.waker());
                // credit may have arrived between the load and the register
                if self.send_credit.load(Ordering::Acquire) == 0
                    && !self.closed.load(Ordering::Acquire)
                {
                    return Poll::Pending;
                }
                continue;
            }

            let take = credit.min(want);
            if self
                .send_credit
                .compare_exchange(credit, credit - take, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Poll::Ready(Some(take));
            }
        }
    }
}

/// A multiplexed stream within the tunnel.
///
/// Reads see end-of-stream once the peer closes its side; dropping the
/// stream closes it and frees its slot in the session.
pub struct TunnelStream {
    id: u32,
    destination: String,
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    window: Arc<StreamWindow>,
    /// Received data not yet handed to the reader
    pending: Bytes,
    /// Bytes consumed since the last window update
    unacked: u32,
    read_eof: bool,
    write_closed: bool,
}

impl TunnelStream {
    pub(super) fn new(
        id: u32,
        destination: String,
        shared: Arc<Shared>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        window: Arc<StreamWindow>,
    ) -> Self {
        Self {
            id,
            destination,
            shared,
            events,
            window,
            pending: Bytes::new(),
            unacked: 0,
            read_eof: false,
            write_closed: false,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Destination this stream was opened for
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub(super) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(super) fn mark_write_closed(&mut self) {
        self.write_closed = true;
    }

    /// Return credit to the peer once half the window has been consumed
    fn consumed(&mut self, len: usize) {
        self.unacked += len as u32;
        if self.unacked >= self.shared.config.window_size / 2 {
            self.window.release(self.unacked);
            self.shared
                .send_frame(Frame::window_update(self.id, self.unacked));
            self.unacked = 0;
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                this.consumed(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }

            match this.events.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(StreamEvent::Data(data))) => this.pending = data,
                Poll::Ready(Some(StreamEvent::Close)) | Poll::Ready(None) => this.read_eof = true,
                Poll::Ready(Some(StreamEvent::Error(e))) => {
                    this.read_eof = true;
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, e)));
                }
            }
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let want = buf.len().min(MAX_DATA_SIZE) as u32;
        let n = match this.window.poll_acquire(cx, want) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Ready(Some(n)) => n as usize,
        };

        let frame = Frame::data(this.id, Bytes::copy_from_slice(&buf[..n]));
        if !this.shared.send_frame(frame) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // the session writer flushes as soon as its queue drains
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_closed {
            this.write_closed = true;
            this.shared.send_frame(Frame::stream_close(this.id));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        if !self.write_closed {
            self.shared.send_frame(Frame::stream_close(self.id));
        }
        self.shared.remove_stream(self.id);
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;

    #[test]
    fn test_window_credit() {
        let window = StreamWindow::new(100);
        let mut cx = Context::from_waker(noop_waker_ref());

        assert_eq!(window.poll_acquire(&mut cx, 60), Poll::Ready(Some(60)));
        assert_eq!(window.poll_acquire(&mut cx, 60), Poll::Ready(Some(40)));
        assert_eq!(window.poll_acquire(&mut cx, 1), Poll::Pending);

        window.add_credit(10);
        assert_eq!(window.poll_acquire(&mut cx, 50), Poll::Ready(Some(10)));

        window.close();
        assert_eq!(window.poll_acquire(&mut cx, 1), Poll::Ready(None));
    }

    #[test]
    fn test_receive_overrun() {
        let window = StreamWindow::new(100);
        assert!(window.on_receive(60, 100));
        assert!(window.on_receive(40, 100));
        assert!(!window.on_receive(1, 100));

        let window = StreamWindow::new(100);
        assert!(window.on_receive(80, 100));
        window.release(80);
        assert!(window.on_receive(100, 100));
    }
}
