//! Agent link acceptor
//!
//! Agents dial the link port, authenticate with a service token and then
//! carry that service's public connections as multiplexed streams.

use crate::registry::ServiceRegistry;
use backhaul_proto::handshake::INVALID_TOKEN;
use backhaul_proto::{read_message, write_message, Command, Message};
use backhaul_transport::{MuxConnection, Role, TransportConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Deadline for each handshake read and write on the server side
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay before retrying after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Accept agent links forever, one task per connection
pub async fn serve_agents(listener: TcpListener, registry: Arc<ServiceRegistry>) {
    if let Ok(addr) = listener.local_addr() {
        info!("Accepting agent links on {}", addr);
    }

    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                debug!(%peer_addr, "Accepted agent connection");
                let registry = registry.clone();
                tokio::spawn(async move {
                    handle_agent(socket, peer_addr, registry).await;
                });
            }
            Err(e) => {
                error!("Failed to accept agent connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Authenticate one agent connection and keep it attached to its service
/// until the link drops or the service closes
pub async fn handle_agent(mut socket: TcpStream, peer_addr: SocketAddr, registry: Arc<ServiceRegistry>) {
    let message = match read_message(&mut socket, HANDSHAKE_TIMEOUT).await {
        Ok(message) => message,
        Err(e) => {
            debug!(%peer_addr, "Agent handshake failed: {}", e);
            return;
        }
    };

    if message.command != Command::ShakeHands {
        debug!(%peer_addr, command = ?message.command, "Unexpected handshake command");
        return;
    }

    let Some(service) = registry.lookup_token(&message.payload) else {
        warn!(%peer_addr, "Agent presented an unknown token");
        let reply = Message::error(INVALID_TOKEN);
        if let Err(e) = write_message(&mut socket, &reply, HANDSHAKE_TIMEOUT).await {
            debug!(%peer_addr, "Failed to send handshake rejection: {}", e);
        }
        return;
    };

    if let Err(e) = write_message(&mut socket, &Message::shake_hands_ok(), HANDSHAKE_TIMEOUT).await {
        warn!(
            service = %service.name(),
            %peer_addr,
            "Failed to acknowledge handshake: {}",
            e
        );
        return;
    }

    let conn = Arc::new(MuxConnection::from_tcp(socket, Role::Server, None));
    if !service.attach_agent(conn.clone()) {
        info!(service = %service.name(), %peer_addr, "Service closed before agent attached");
        conn.close();
        return;
    }

    info!(
        service = %service.name(),
        port = service.port(),
        conn = %conn.connection_id(),
        %peer_addr,
        "Agent attached"
    );

    conn.closed().await;
    service.detach_agent(&conn);

    let stats = conn.stats();
    match conn.last_error() {
        Some(e) => warn!(
            service = %service.name(),
            conn = %conn.connection_id(),
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            uptime_secs = stats.uptime_secs,
            "Agent link failed: {}",
            e
        ),
        None => info!(
            service = %service.name(),
            conn = %conn.connection_id(),
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            uptime_secs = stats.uptime_secs,
            "Agent detached"
        ),
    }
}
