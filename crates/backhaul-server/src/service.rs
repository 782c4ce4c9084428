//! One exposed public port and the agents attached to it

use backhaul_transport::{dual_copy, MuxConnection, TransportConnection};
use rand::seq::SliceRandom;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before retrying after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An exposed port.
///
/// Owns the public listener (through its accept task) and every agent
/// connection attached to it. Closing happens exactly once; after that no
/// agent can attach and no public connection is accepted.
pub struct Service {
    name: String,
    port: u16,
    token: String,
    closed: AtomicBool,
    shutdown: CancellationToken,
    agents: Mutex<Vec<Arc<MuxConnection>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Service {
    /// Create the service and start accepting on `listener`
    pub(crate) fn start(name: String, token: String, port: u16, listener: TcpListener) -> Arc<Self> {
        let service = Arc::new(Self {
            name,
            port,
            token,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            agents: Mutex::new(Vec::new()),
            accept_task: Mutex::new(None),
        });

        let handle = tokio::spawn(service.clone().accept_loop(listener));
        *lock(&service.accept_task) = Some(handle);
        service
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of agent connections currently attached
    pub fn agent_count(&self) -> usize {
        lock(&self.agents).len()
    }

    /// Attach an authenticated agent connection.
    ///
    /// Returns `false` if the service is already closed; the caller keeps
    /// ownership of the connection in that case.
    pub fn attach_agent(&self, conn: Arc<MuxConnection>) -> bool {
        let mut agents = lock(&self.agents);
        if self.is_closed() {
            return false;
        }
        agents.push(conn);
        true
    }

    pub fn detach_agent(&self, conn: &Arc<MuxConnection>) {
        lock(&self.agents).retain(|c| !Arc::ptr_eq(c, conn));
    }

    fn pick_agent(&self) -> Option<Arc<MuxConnection>> {
        lock(&self.agents).choose(&mut rand::thread_rng()).cloned()
    }

    /// Close the service: stop accepting, release the listener and close
    /// every attached agent connection.
    ///
    /// Returns `true` only for the call that performed the close.
    pub async fn close(&self) -> bool {
        let agents = {
            let mut agents = lock(&self.agents);
            if self
                .closed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return false;
            }
            std::mem::take(&mut *agents)
        };

        // Everything before the await below happens even if this future is
        // dropped; the accept task still stops on the cancelled token
        self.shutdown.cancel();
        for conn in &agents {
            conn.close();
        }

        // The accept task owns the listener; once it returns the port is free
        let accept_task = lock(&self.accept_task).take();
        if let Some(handle) = accept_task {
            if let Err(e) = handle.await {
                warn!(service = %self.name, port = self.port, "Accept task failed: {}", e);
            }
        }

        info!(
            service = %self.name,
            port = self.port,
            agents = agents.len(),
            "Service closed"
        );
        true
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!(service = %self.name, port = self.port, "Accepting public connections");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    let Some(agent) = self.pick_agent() else {
                        debug!(
                            service = %self.name,
                            port = self.port,
                            %peer_addr,
                            "No agent attached, dropping connection"
                        );
                        continue;
                    };

                    let name = self.name.clone();
                    tokio::spawn(async move {
                        relay_public(socket, peer_addr, agent, &name).await;
                    });
                }
                Err(e) => {
                    if self.is_closed() {
                        break;
                    }
                    error!(
                        service = %self.name,
                        port = self.port,
                        "Failed to accept connection: {}",
                        e
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        }

        debug!(service = %self.name, port = self.port, "Accept loop stopped");
    }
}

/// Disconnects that are a normal way for a tunnelled connection to end
pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

async fn relay_public(
    socket: TcpStream,
    peer_addr: SocketAddr,
    agent: Arc<MuxConnection>,
    service: &str,
) {
    let stream = match agent.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%service, %peer_addr, "Failed to open stream to agent: {}", e);
            return;
        }
    };
    let stream_id = stream.stream_id();

    debug!(%service, %peer_addr, stream_id, "Relaying public connection");
    match dual_copy(socket, stream).await {
        Ok(()) => debug!(%service, %peer_addr, stream_id, "Relay finished"),
        Err(e) if is_disconnect(&e) => {
            debug!(%service, %peer_addr, stream_id, "Relay ended: {}", e)
        }
        Err(e) => error!(%service, %peer_addr, stream_id, "Relay failed: {}", e),
    }
}
