//! Backhaul agent
//!
//! Runs next to a private backend. Dials the exposure server's link port,
//! authenticates with a service token and relays every stream the server
//! opens to a connection from the [`LocalPool`].

pub mod api_client;
pub mod config;
pub mod link;
pub mod pool;

pub use api_client::{normalize_api_url, ApiClient, ApiClientError};
pub use config::AgentConfig;
pub use link::{handshake, AgentLink, LinkConfig, LinkError};
pub use pool::{LocalPool, PoolError};
