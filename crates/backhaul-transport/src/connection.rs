//! Multiplexed connection over a single authenticated link
//!
//! One writer task drains a frame queue into the socket, one reader task
//! decodes frames and routes them to the streams they belong to. Each side
//! allocates stream ids from its own parity (server even, client odd) so both
//! ends may open streams without coordination.
//!
//! Each stream may have at most [`STREAM_WINDOW`] unread bytes in flight. The
//! receiving stream hands credit back with window updates as it is read, so
//! the reader task never waits on a slow stream.

use async_trait::async_trait;
use backhaul_proto::{Frame, FrameCodec, FrameType, StreamId};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::stream::{MuxStream, StreamState};
use crate::{ConnectionStats, TransportConnection, TransportError, TransportResult};

/// Frames queued for the writer task before stream writes apply backpressure
const FRAME_QUEUE_SIZE: usize = 256;

/// Bytes a peer may have in flight on one stream before it must wait for a
/// window update. Also bounds what one unread stream can buffer locally.
pub const STREAM_WINDOW: usize = 256 * 1024;

/// Which end of the physical connection this side is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection
    Client,
    /// Accepted the connection
    Server,
}

impl Role {
    fn first_stream_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Invoked on the reader task for every stream the peer opens.
///
/// Must hand the stream off (usually via `tokio::spawn`) and return
/// immediately; it blocks frame delivery for the whole connection otherwise.
pub type StreamHandler = Arc<dyn Fn(MuxStream) + Send + Sync>;

struct StreamSlot {
    /// `None` once the peer sent FIN
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    state: Arc<StreamState>,
}

/// State shared by the connection handle, its two tasks and its streams
pub(crate) struct Shared {
    connection_id: String,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    frame_tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    last_error: Mutex<Option<Arc<TransportError>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub(crate) fn frame_sender(&self) -> mpsc::Sender<Frame> {
        self.frame_tx.clone()
    }

    pub(crate) fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Register a stream id. `None` if the id is already live.
    fn register(
        &self,
        stream_id: StreamId,
    ) -> Option<(mpsc::UnboundedReceiver<Bytes>, Arc<StreamState>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(StreamState::new(STREAM_WINDOW));

        let mut streams = lock(&self.streams);
        if self.closed.load(Ordering::SeqCst) {
            // tx is dropped here, so the stream reads EOF straight away
            state.reset();
            return Some((rx, state));
        }

        match streams.entry(stream_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(e) => {
                e.insert(StreamSlot {
                    tx: Some(tx),
                    state: state.clone(),
                });
                Some((rx, state))
            }
        }
    }

    /// Drop local bookkeeping for a stream that went away on this side
    pub(crate) fn forget(&self, stream_id: StreamId) {
        lock(&self.streams).remove(&stream_id);
    }

    fn receiver_for(
        &self,
        stream_id: StreamId,
    ) -> Option<(mpsc::UnboundedSender<Bytes>, Arc<StreamState>)> {
        lock(&self.streams)
            .get(&stream_id)
            .and_then(|slot| Some((slot.tx.clone()?, slot.state.clone())))
    }

    fn state_for(&self, stream_id: StreamId) -> Option<Arc<StreamState>> {
        lock(&self.streams)
            .get(&stream_id)
            .map(|slot| slot.state.clone())
    }

    fn finish_stream(&self, stream_id: StreamId) {
        if let Some(slot) = lock(&self.streams).get_mut(&stream_id) {
            slot.tx = None;
        }
    }

    fn reset_stream(&self, stream_id: StreamId) {
        if let Some(slot) = lock(&self.streams).remove(&stream_id) {
            slot.state.reset();
        }
    }

    /// Stop the connection. Only the first caller wins; its error (if any)
    /// becomes the connection's terminal error.
    fn terminate(&self, error: Option<TransportError>) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        if let Some(e) = error {
            *lock(&self.last_error) = Some(Arc::new(e));
        }

        let streams = std::mem::take(&mut *lock(&self.streams));
        for slot in streams.into_values() {
            slot.state.reset();
        }

        self.shutdown.cancel();
        true
    }
}

/// Multiplexed connection over one physical link
pub struct MuxConnection {
    shared: Arc<Shared>,
    role: Role,
    remote_addr: Option<SocketAddr>,
    next_stream_id: AtomicU32,
    created_at: Instant,
}

impl std::fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnection")
            .field("connection_id", &self.shared.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("role", &self.role)
            .finish()
    }
}

impl MuxConnection {
    /// Wrap an established byte stream and start the reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T>(
        io: T,
        remote_addr: Option<SocketAddr>,
        role: Role,
        handler: Option<StreamHandler>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection_id = format!("mux-{}", uuid::Uuid::new_v4());
        let (read_half, write_half) = tokio::io::split(io);

        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE_SIZE);

        let shared = Arc::new(Shared {
            connection_id,
            streams: Mutex::new(HashMap::new()),
            frame_tx,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            last_error: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        });

        let sink = FramedWrite::new(write_half, FrameCodec::new());
        tokio::spawn(Self::writer_task(sink, frame_rx, shared.clone()));

        let source = FramedRead::new(read_half, FrameCodec::new());
        tokio::spawn(Self::reader_task(source, handler, shared.clone()));

        Self {
            shared,
            role,
            remote_addr,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            created_at: Instant::now(),
        }
    }

    /// Wrap an authenticated TCP link
    pub fn from_tcp(socket: TcpStream, role: Role, handler: Option<StreamHandler>) -> Self {
        let remote_addr = socket.peer_addr().ok();
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on link: {}", e);
        }
        Self::new(socket, remote_addr, role, handler)
    }

    /// Writer task - drains queued frames into the socket
    async fn writer_task<W>(
        mut sink: FramedWrite<W, FrameCodec>,
        mut rx: mpsc::Receiver<Frame>,
        shared: Arc<Shared>,
    ) where
        W: AsyncWrite + Send + Unpin,
    {
        let result = tokio::select! {
            r = Self::write_loop(&mut sink, &mut rx, &shared) => r,
            _ = shared.shutdown.cancelled() => Ok(()),
        };

        if let Err(e) = &result {
            debug!("[{}] Link write failed: {}", shared.connection_id, e);
        }
        trace!("[{}] Writer task ended", shared.connection_id);
        shared.terminate(result.err());
    }

    async fn write_loop<W>(
        sink: &mut FramedWrite<W, FrameCodec>,
        rx: &mut mpsc::Receiver<Frame>,
        shared: &Shared,
    ) -> TransportResult<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        while let Some(frame) = rx.recv().await {
            shared
                .bytes_sent
                .fetch_add((Frame::HEADER_SIZE + frame.payload.len()) as u64, Ordering::Relaxed);
            sink.feed(frame).await?;

            // Batch whatever else is already queued before paying for a flush
            while let Ok(frame) = rx.try_recv() {
                shared
                    .bytes_sent
                    .fetch_add((Frame::HEADER_SIZE + frame.payload.len()) as u64, Ordering::Relaxed);
                sink.feed(frame).await?;
            }
            sink.flush().await?;
        }
        Ok(())
    }

    /// Reader task - receives frames and dispatches to streams
    async fn reader_task<R>(
        mut source: FramedRead<R, FrameCodec>,
        handler: Option<StreamHandler>,
        shared: Arc<Shared>,
    ) where
        R: AsyncRead + Send + Unpin,
    {
        let result: TransportResult<()> = loop {
            let next = tokio::select! {
                next = source.next() => next,
                _ = shared.shutdown.cancelled() => break Ok(()),
            };

            match next {
                Some(Ok(frame)) => {
                    shared.bytes_received.fetch_add(
                        (Frame::HEADER_SIZE + frame.payload.len()) as u64,
                        Ordering::Relaxed,
                    );
                    Self::dispatch(&shared, handler.as_ref(), frame).await;
                }
                Some(Err(e)) => break Err(e.into()),
                None => {
                    debug!("[{}] Link closed by peer", shared.connection_id);
                    break Ok(());
                }
            }
        };

        if let Err(e) = &result {
            debug!("[{}] Link read failed: {}", shared.connection_id, e);
        }
        trace!("[{}] Reader task ended", shared.connection_id);
        shared.terminate(result.err());
    }

    async fn dispatch(shared: &Arc<Shared>, handler: Option<&StreamHandler>, frame: Frame) {
        let stream_id = frame.stream_id;

        match frame.frame_type {
            FrameType::Open => {
                let Some((rx, state)) = shared.register(stream_id) else {
                    warn!(
                        "[{}] Peer reopened live stream {}",
                        shared.connection_id, stream_id
                    );
                    return;
                };

                let stream = MuxStream::new(stream_id, rx, state, shared.clone());
                match handler {
                    Some(handler) => {
                        trace!("[{}] Accepted stream {}", shared.connection_id, stream_id);
                        handler(stream);
                    }
                    None => {
                        debug!(
                            "[{}] No stream handler, resetting stream {}",
                            shared.connection_id, stream_id
                        );
                        drop(stream);
                    }
                }
            }
            FrameType::Data => {
                if frame.payload.is_empty() {
                    return;
                }
                let Some((tx, state)) = shared.receiver_for(stream_id) else {
                    trace!(
                        "[{}] Data for unknown stream {}",
                        shared.connection_id, stream_id
                    );
                    return;
                };

                // Never wait on one stream here; a peer past its window gets reset
                if !state.receive(frame.payload.len(), STREAM_WINDOW) {
                    warn!(
                        "[{}] Peer overran the window on stream {}, resetting",
                        shared.connection_id, stream_id
                    );
                    shared.reset_stream(stream_id);
                    tokio::select! {
                        _ = shared.frame_tx.send(Frame::reset(stream_id)) => {}
                        _ = shared.shutdown.cancelled() => {}
                    }
                    return;
                }

                if tx.send(frame.payload).is_err() {
                    trace!("[{}] Stream {} receiver dropped", shared.connection_id, stream_id);
                }
            }
            FrameType::WindowUpdate => {
                let Some(credit) = frame.window_credit() else {
                    warn!(
                        "[{}] Malformed window update on stream {}",
                        shared.connection_id, stream_id
                    );
                    return;
                };
                if let Some(state) = shared.state_for(stream_id) {
                    state.grant(credit as usize);
                }
            }
            FrameType::Close => {
                if frame.flags.has_rst() {
                    shared.reset_stream(stream_id);
                } else {
                    shared.finish_stream(stream_id);
                }
            }
        }
    }
}

#[async_trait]
impl TransportConnection for MuxConnection {
    type Stream = MuxStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        // Step by 2 to stay on this side's parity
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);

        let (rx, state) = self
            .shared
            .register(stream_id)
            .ok_or_else(|| TransportError::ProtocolError(format!("stream {} in use", stream_id)))?;
        let stream = MuxStream::new(stream_id, rx, state, self.shared.clone());

        self.shared
            .frame_tx
            .send(Frame::open(stream_id))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        debug!("[{}] Opened stream {}", self.shared.connection_id, stream_id);
        Ok(stream)
    }

    fn close(&self) -> bool {
        let closed = self.shared.terminate(None);
        if closed {
            debug!("[{}] Connection closed", self.shared.connection_id);
        }
        closed
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    fn last_error(&self) -> Option<Arc<TransportError>> {
        lock(&self.shared.last_error).clone()
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            active_streams: lock(&self.shared.streams).len(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    fn connection_id(&self) -> String {
        self.shared.connection_id.clone()
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        self.shared.terminate(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn echo_handler() -> StreamHandler {
        Arc::new(|mut stream: MuxStream| {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = stream.shutdown().await;
            });
        })
    }

    fn pair(handler: Option<StreamHandler>) -> (MuxConnection, MuxConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = MuxConnection::new(a, None, Role::Server, None);
        let client = MuxConnection::new(b, None, Role::Client, handler);
        (server, client)
    }

    #[tokio::test]
    async fn test_open_stream_echo() {
        let (server, _client) = pair(Some(echo_handler()));

        let mut stream = server.open_stream().await.unwrap();
        stream.write_all(b"hello over mux").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"hello over mux");
    }

    #[tokio::test]
    async fn test_stream_ids_follow_role_parity() {
        let (server, client) = pair(Some(echo_handler()));

        let s1 = server.open_stream().await.unwrap();
        let s2 = server.open_stream().await.unwrap();
        let c1 = client.open_stream().await.unwrap();

        assert_eq!(s1.stream_id(), 2);
        assert_eq!(s2.stream_id(), 4);
        assert_eq!(c1.stream_id(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_streams_are_independent() {
        let (server, _client) = pair(Some(echo_handler()));
        let server = Arc::new(server);

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let server = server.clone();
            tasks.push(tokio::spawn(async move {
                let mut stream = server.open_stream().await.unwrap();
                let payload = vec![i; 10_000];
                stream.write_all(&payload).await.unwrap();
                stream.shutdown().await.unwrap();

                let mut echoed = Vec::new();
                stream.read_to_end(&mut echoed).await.unwrap();
                assert_eq!(echoed, payload);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stream_without_handler_is_reset() {
        let (server, _client) = pair(None);

        let mut stream = server.open_stream().await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(stream.is_reset());
    }

    /// Peer side: "B" asks for a bulk download, "P" for a single pong
    fn bulk_or_pong_handler(written: Arc<AtomicU64>) -> StreamHandler {
        Arc::new(move |mut stream: MuxStream| {
            let written = written.clone();
            tokio::spawn(async move {
                let mut request = [0u8; 1];
                if stream.read_exact(&mut request).await.is_err() {
                    return;
                }
                match &request {
                    b"B" => {
                        let chunk = vec![b'x'; 64 * 1024];
                        for _ in 0..128 {
                            if stream.write_all(&chunk).await.is_err() {
                                return;
                            }
                            written.fetch_add(chunk.len() as u64, Ordering::SeqCst);
                        }
                    }
                    _ => {
                        let _ = stream.write_all(b"pong").await;
                    }
                }
                let _ = stream.shutdown().await;
            });
        })
    }

    #[tokio::test]
    async fn test_unread_stream_does_not_stall_others() {
        let written = Arc::new(AtomicU64::new(0));
        let (server, _client) = pair(Some(bulk_or_pong_handler(written.clone())));

        // 8 MiB requested and never read
        let mut bulk = server.open_stream().await.unwrap();
        bulk.write_all(b"B").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut ping = server.open_stream().await.unwrap();
        ping.write_all(b"P").await.unwrap();
        let mut reply = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(3), ping.read_exact(&mut reply))
            .await
            .expect("other stream stalled behind an unread one")
            .unwrap();
        assert_eq!(&reply, b"pong");

        // The bulk writer is parked on its window
        assert!(written.load(Ordering::SeqCst) <= STREAM_WINDOW as u64);

        // Reading grants credit and the transfer completes
        let mut received = vec![0u8; 8 * 1024 * 1024];
        tokio::time::timeout(Duration::from_secs(10), bulk.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.iter().all(|b| *b == b'x'));
    }

    #[tokio::test]
    async fn test_window_overrun_resets_stream() {
        let (raw, b) = tokio::io::duplex(1024 * 1024);
        let (streams_tx, mut streams) = mpsc::unbounded_channel();
        let conn = MuxConnection::new(
            b,
            None,
            Role::Client,
            Some(Arc::new(move |stream: MuxStream| {
                let _ = streams_tx.send(stream);
            })),
        );

        let (raw_read, raw_write) = tokio::io::split(raw);
        let mut peer_tx = FramedWrite::new(raw_write, FrameCodec::new());
        let mut peer_rx = FramedRead::new(raw_read, FrameCodec::new());

        peer_tx.send(Frame::open(2)).await.unwrap();
        let stream = streams.recv().await.unwrap();

        // One byte past the window, with nothing read locally
        peer_tx
            .send(Frame::data(2, Bytes::from(vec![0u8; STREAM_WINDOW])))
            .await
            .unwrap();
        peer_tx
            .send(Frame::data(2, Bytes::from_static(b"x")))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), peer_rx.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::reset(2));
        assert!(stream.is_reset());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (server, client) = pair(None);

        assert!(server.close());
        assert!(!server.close());
        assert!(server.is_closed());
        assert!(server.last_error().is_none());
        assert!(matches!(
            server.open_stream().await,
            Err(TransportError::ConnectionClosed)
        ));

        // The peer notices the link went away
        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_close_ends_open_streams() {
        let (server, _client) = pair(Some(Arc::new(|stream: MuxStream| {
            // Hold the stream open without answering
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(stream);
            });
        })));

        let mut stream = server.open_stream().await.unwrap();
        server.close();

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(stream.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_sets_last_error() {
        let (mut raw, b) = tokio::io::duplex(1024);
        let conn = MuxConnection::new(b, None, Role::Client, None);

        // Frame type 9 does not exist
        raw.write_all(&[0, 0, 0, 1, 9, 0, 0, 0, 0, 0]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), conn.closed())
            .await
            .unwrap();
        let err = conn.last_error().expect("terminal error recorded");
        assert!(matches!(*err, TransportError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_stats_count_traffic() {
        let (server, _client) = pair(Some(echo_handler()));

        let mut stream = server.open_stream().await.unwrap();
        stream.write_all(b"12345").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();

        let stats = server.stats();
        assert!(stats.bytes_sent >= 5);
        assert!(stats.bytes_received >= 5);
        assert_eq!(stats.active_streams, 1);
        assert!(server.connection_id().starts_with("mux-"));
    }
}
