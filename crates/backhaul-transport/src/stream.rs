//! Logical byte stream carried by a [`MuxConnection`](crate::MuxConnection)

use backhaul_proto::{Frame, StreamId};
use bytes::Bytes;
use futures::task::AtomicWaker;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::PollSender;
use tracing::trace;

use crate::connection::Shared;

/// Largest payload put into a single data frame
const MAX_WRITE_CHUNK: usize = 32 * 1024;

/// Per-stream state shared with the connection's reader task
pub(crate) struct StreamState {
    reset: AtomicBool,
    /// Bytes this side may still send before the peer grants more
    send_credit: AtomicUsize,
    credit_waker: AtomicWaker,
    /// Bytes received from the peer and not yet credited back
    unacked: AtomicUsize,
}

impl StreamState {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            reset: AtomicBool::new(false),
            send_credit: AtomicUsize::new(window),
            credit_waker: AtomicWaker::new(),
            unacked: AtomicUsize::new(0),
        }
    }

    pub(crate) fn reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
        self.credit_waker.wake();
    }

    pub(crate) fn grant(&self, credit: usize) {
        self.send_credit.fetch_add(credit, Ordering::SeqCst);
        self.credit_waker.wake();
    }

    /// Account for `len` received bytes; `false` if the peer overran `window`
    pub(crate) fn receive(&self, len: usize, window: usize) -> bool {
        self.unacked.fetch_add(len, Ordering::SeqCst) + len <= window
    }
}

/// One bidirectional stream on a multiplexed link.
///
/// `shutdown()` half-closes the write side (FIN). Dropping the stream before
/// the peer finished resets it (RST). Writes wait for send credit, which the
/// peer grants back as its reader consumes data.
pub struct MuxStream {
    stream_id: StreamId,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    /// Bytes read by the application and not yet credited to the peer
    consumed: usize,
    tx: PollSender<Frame>,
    state: Arc<StreamState>,
    write_closed: bool,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("connection_id", &self.shared.connection_id())
            .field("stream_id", &self.stream_id)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream reset")
}

/// Queue a control frame without waiting; a full queue hands it to a task
fn send_control(tx: &mpsc::Sender<Frame>, frame: Frame) {
    match tx.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(frame)) => {
            let tx = tx.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = tx.send(frame).await;
                });
            }
        }
        Err(TrySendError::Closed(frame)) => {
            trace!("Link gone before {:?} on stream {}", frame.frame_type, frame.stream_id);
        }
    }
}

impl MuxStream {
    pub(crate) fn new(
        stream_id: StreamId,
        rx: mpsc::UnboundedReceiver<Bytes>,
        state: Arc<StreamState>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            stream_id,
            rx,
            pending: Bytes::new(),
            consumed: 0,
            tx: PollSender::new(shared.frame_sender()),
            state,
            write_closed: false,
            shared,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Whether the peer reset the stream or the link went down
    pub fn is_reset(&self) -> bool {
        self.state.reset.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        !self.write_closed && !self.is_reset()
    }

    /// Send credit available right now, or register for the next grant
    fn poll_credit(&self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let credit = self.state.send_credit.load(Ordering::SeqCst);
        if credit > 0 {
            return Poll::Ready(Ok(credit));
        }

        self.state.credit_waker.register(cx.waker());
        if self.is_reset() {
            return Poll::Ready(Err(broken_pipe()));
        }
        match self.state.send_credit.load(Ordering::SeqCst) {
            0 => Poll::Pending,
            credit => Poll::Ready(Ok(credit)),
        }
    }

    /// Hand consumed bytes back to the peer once half a window has built up
    fn credit_peer(&mut self, n: usize) {
        self.consumed += n;
        if self.consumed < crate::connection::STREAM_WINDOW / 2 || self.is_reset() {
            return;
        }

        let Some(tx) = self.tx.get_ref() else {
            return;
        };
        let credit = std::mem::take(&mut self.consumed);
        self.state.unacked.fetch_sub(credit, Ordering::SeqCst);
        send_control(tx, Frame::window_update(self.stream_id, credit as u32));
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.pending.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                // FIN, RST or link loss all end the read side
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending.split_to(n));
        this.credit_peer(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if !this.is_writable() {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // Only this writer spends credit, so it can only grow until we do
        let credit = ready!(this.poll_credit(cx))?;
        ready!(this.tx.poll_reserve(cx)).map_err(|_| broken_pipe())?;

        let n = buf.len().min(MAX_WRITE_CHUNK).min(credit);
        this.tx
            .send_item(Frame::data(this.stream_id, Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| broken_pipe())?;
        this.state.send_credit.fetch_sub(n, Ordering::SeqCst);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The writer task flushes the link after every batch
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.is_writable() {
            return Poll::Ready(Ok(()));
        }

        ready!(this.tx.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        this.tx
            .send_item(Frame::fin(this.stream_id))
            .map_err(|_| broken_pipe())?;
        this.write_closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.forget(self.stream_id);

        // Already torn down by the peer or by the link closing
        if self.state.reset.swap(true, Ordering::SeqCst) {
            return;
        }

        self.tx.abort_send();
        if let Some(tx) = self.tx.get_ref() {
            send_control(tx, Frame::reset(self.stream_id));
        }
    }
}
