//! Backhaul exposure server
//!
//! Exposes public TCP ports on behalf of agents. Each exposed port is a
//! [`Service`] bound to a random token; agents that present the token over
//! the link port are attached to that service and receive one multiplexed
//! stream per public connection.

pub mod api;
pub mod config;
pub mod link;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod token;

pub use api::{create_app, AppState};
pub use config::{ExposeConfig, HooksConfig};
pub use link::{handle_agent, serve_agents, HANDSHAKE_TIMEOUT};
pub use orchestrator::{ExecOrchestrator, HookCommand, OrchestrationError, Orchestrator};
pub use registry::{RegistryError, ServiceInfo, ServiceRegistry};
pub use service::Service;
pub use token::generate_token;
