//! Agent side of the link
//!
//! Dials the exposure server, authenticates with the service token and
//! serves every stream the server opens by relaying it to a backend
//! connection from the pool.

use crate::pool::LocalPool;
use backhaul_proto::{read_message, write_message, Command, HandshakeError, Message};
use backhaul_transport::{
    dual_copy, MuxConnection, MuxStream, Role, StreamHandler, TransportConnection, TransportError,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deadline for sending the token
pub const HANDSHAKE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for the server's verdict
pub const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Link errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Link lost: {0}")]
    Lost(Arc<TransportError>),
}

impl LinkError {
    /// The server refused the token; retrying cannot help
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Handshake(HandshakeError::Rejected(_)))
    }
}

/// Link settings
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Exposure server link address
    pub link_addr: String,
    pub token: String,
    /// Local backend address
    pub backend: String,
    /// Idle backend connections kept ready
    pub backend_conns: usize,
    /// Parallel physical links to the server
    pub links: usize,
    /// Re-dial dropped links with exponential backoff
    pub reconnect: bool,
}

/// Authenticate a freshly dialed link
pub async fn handshake(socket: &mut TcpStream, token: &str) -> Result<(), HandshakeError> {
    write_message(socket, &Message::shake_hands(token), HANDSHAKE_WRITE_TIMEOUT).await?;

    let reply = read_message(socket, HANDSHAKE_READ_TIMEOUT).await?;
    match reply.command {
        Command::ShakeHandsOk => Ok(()),
        Command::Error => Err(HandshakeError::Rejected(reply.payload)),
        other => Err(HandshakeError::UnexpectedCommand(other)),
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

async fn serve_stream(stream: MuxStream, pool: Arc<LocalPool>) {
    let stream_id = stream.stream_id();

    let backend = match pool.get().await {
        Ok(backend) => backend,
        Err(e) => {
            error!(stream_id, "Failed to get backend connection: {}", e);
            return;
        }
    };

    debug!(stream_id, backend = %pool.address(), "Relaying stream to backend");
    match dual_copy(stream, backend).await {
        Ok(()) => debug!(stream_id, "Relay finished"),
        Err(e) if is_disconnect(&e) => debug!(stream_id, "Relay ended: {}", e),
        Err(e) => error!(stream_id, "Relay failed: {}", e),
    }
}

/// A running agent: one backend pool shared by one or more links
pub struct AgentLink {
    config: LinkConfig,
    pool: Arc<LocalPool>,
    shutdown: CancellationToken,
}

impl AgentLink {
    /// Create the link and start filling the backend pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: LinkConfig) -> Self {
        let pool = Arc::new(LocalPool::start(config.backend.clone(), config.backend_conns));
        Self {
            config,
            pool,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn pool(&self) -> &Arc<LocalPool> {
        &self.pool
    }

    fn stream_handler(&self) -> StreamHandler {
        let pool = self.pool.clone();
        Arc::new(move |stream: MuxStream| {
            tokio::spawn(serve_stream(stream, pool.clone()));
        })
    }

    /// Dial and authenticate one link
    pub async fn connect(&self) -> Result<MuxConnection, LinkError> {
        let mut socket = TcpStream::connect(&self.config.link_addr)
            .await
            .map_err(|source| LinkError::Connect {
                addr: self.config.link_addr.clone(),
                source,
            })?;

        handshake(&mut socket, &self.config.token).await?;

        Ok(MuxConnection::from_tcp(
            socket,
            Role::Client,
            Some(self.stream_handler()),
        ))
    }

    /// Keep one link up; returns when it ends and reconnecting is off, on a
    /// fatal error, or on shutdown
    async fn run_link(&self, index: usize) -> Result<(), LinkError> {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let result = match self.connect().await {
                Ok(conn) => {
                    backoff = INITIAL_BACKOFF;
                    info!(
                        link = index,
                        conn = %conn.connection_id(),
                        server = %self.config.link_addr,
                        remote = ?conn.remote_address(),
                        "Link established"
                    );

                    tokio::select! {
                        _ = conn.closed() => {}
                        _ = self.shutdown.cancelled() => {
                            conn.close();
                        }
                    }

                    let stats = conn.stats();
                    debug!(
                        link = index,
                        conn = %conn.connection_id(),
                        bytes_sent = stats.bytes_sent,
                        bytes_received = stats.bytes_received,
                        active_streams = stats.active_streams,
                        uptime_secs = stats.uptime_secs,
                        "Link ended"
                    );

                    match conn.last_error() {
                        Some(e) => Err(LinkError::Lost(e)),
                        None => Ok(()),
                    }
                }
                Err(e) => Err(e),
            };

            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let fatal = matches!(&result, Err(e) if e.is_fatal());
            if fatal || !self.config.reconnect {
                return result;
            }
            match &result {
                Ok(()) => info!(link = index, "Link closed"),
                Err(e) => warn!(link = index, "{}", e),
            }

            info!(link = index, "Reconnecting in {}s...", backoff.as_secs());
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Run every configured link until all of them end or one fails
    pub async fn run(&self) -> Result<(), LinkError> {
        let links = self.config.links.max(1);
        // A failed link drops its siblings along with their connections
        futures::future::try_join_all((0..links).map(|i| self.run_link(i)))
            .await
            .map(|_| ())
    }

    /// Stop every link and the backend pool
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::handshake::INVALID_TOKEN;
    use tokio::net::TcpListener;

    /// One-shot server that answers the handshake with `reply`
    async fn answering(reply: Message) -> (String, tokio::task::JoinHandle<Message>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let hello = read_message(&mut socket, Duration::from_secs(5)).await.unwrap();
            write_message(&mut socket, &reply, Duration::from_secs(5))
                .await
                .unwrap();
            hello
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_handshake_ok() {
        let (addr, server) = answering(Message::shake_hands_ok()).await;
        let mut socket = TcpStream::connect(&addr).await.unwrap();

        handshake(&mut socket, "tok").await.unwrap();
        assert_eq!(server.await.unwrap(), Message::shake_hands("tok"));
    }

    #[tokio::test]
    async fn test_handshake_rejected_carries_reason() {
        let (addr, _server) = answering(Message::error(INVALID_TOKEN)).await;
        let mut socket = TcpStream::connect(&addr).await.unwrap();

        match handshake(&mut socket, "tok").await {
            Err(HandshakeError::Rejected(reason)) => assert_eq!(reason, INVALID_TOKEN),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_unexpected_reply() {
        let (addr, _server) = answering(Message::shake_hands("echo")).await;
        let mut socket = TcpStream::connect(&addr).await.unwrap();

        let err = handshake(&mut socket, "tok").await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::UnexpectedCommand(Command::ShakeHands)
        ));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_rejection_is_fatal_even_with_reconnect() {
        let (addr, _server) = answering(Message::error(INVALID_TOKEN)).await;
        let link = AgentLink::new(LinkConfig {
            link_addr: addr,
            token: "tok".to_string(),
            backend: "127.0.0.1:9".to_string(),
            backend_conns: 0,
            links: 1,
            reconnect: true,
        });

        let err = tokio::time::timeout(Duration::from_secs(5), link.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_connect_refused_without_reconnect() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let link = AgentLink::new(LinkConfig {
            link_addr: addr,
            token: "tok".to_string(),
            backend: "127.0.0.1:9".to_string(),
            backend_conns: 0,
            links: 2,
            reconnect: false,
        });

        let err = link.run().await.unwrap_err();
        assert!(matches!(err, LinkError::Connect { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_lost_link_is_not_fatal() {
        let err = LinkError::Lost(Arc::new(TransportError::ConnectionClosed));
        assert!(!err.is_fatal());
    }
}
