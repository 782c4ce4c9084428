//! Transport layer for backhaul links
//!
//! An authenticated link is one physical TCP connection. After the handshake
//! it is wrapped in a [`MuxConnection`], which carries many independent,
//! ordered byte streams. Streams are plain `AsyncRead + AsyncWrite` values so
//! the [`relay`] can pump them against any other socket.
//!
//! ```text
//!  public client ──tcp──▶ exposure server ══ link (mux) ══▶ agent ──tcp──▶ backend
//!                          open_stream()                  StreamHandler
//! ```

pub mod connection;
pub mod relay;
pub mod stream;

pub use connection::{MuxConnection, Role, StreamHandler};
pub use relay::dual_copy;
pub use stream::MuxStream;

use async_trait::async_trait;
use backhaul_proto::MuxError;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl From<MuxError> for TransportError {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::Io(e) => TransportError::IoError(e),
            other => TransportError::ProtocolError(other.to_string()),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A connection that carries many logical streams
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    /// The stream type created by this connection
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a new bidirectional stream
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Close the connection and every stream on it.
    ///
    /// Returns `true` only for the call that actually performed the close.
    fn close(&self) -> bool;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Resolves once the connection has stopped, for whatever reason
    async fn closed(&self);

    /// Terminal error that stopped the connection, if it did not end cleanly
    fn last_error(&self) -> Option<Arc<TransportError>>;

    /// Get the remote peer address, when the underlying IO has one
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Get connection statistics
    fn stats(&self) -> ConnectionStats;

    /// Get a unique stable identifier for this connection
    fn connection_id(&self) -> String;
}

/// Statistics about a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Number of bytes sent
    pub bytes_sent: u64,

    /// Number of bytes received
    pub bytes_received: u64,

    /// Number of active streams
    pub active_streams: usize,

    /// Connection uptime (seconds)
    pub uptime_secs: u64,
}
