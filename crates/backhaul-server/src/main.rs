//! Backhaul exposure server
//!
//! Accepts agent links and exposes public ports on their behalf.

use anyhow::{Context, Result};
use backhaul_server::api::{self, AppState};
use backhaul_server::config::DEFAULT_CONFIG_PATH;
use backhaul_server::{serve_agents, ExposeConfig, ServiceRegistry};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "backhaul-expose",
    about = "Expose public ports for backhaul agents",
    version
)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "BACKHAUL_EXPOSE_CONFIG")]
    config: Option<PathBuf>,

    /// Address agents dial (overrides config file)
    #[arg(long)]
    link: Option<String>,

    /// Control API address (overrides config file)
    #[arg(long)]
    api: Option<String>,

    /// Host exposed ports bind on (overrides config file)
    #[arg(long)]
    bind_host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };
    let mut config = ExposeConfig::load_or_default(&path, required)?;

    if let Some(link) = cli.link {
        config.link = link;
    }
    if let Some(api) = cli.api {
        config.api = api;
    }
    if let Some(bind_host) = cli.bind_host {
        config.bind_host = bind_host;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    setup_logging(&config.log_level)?;

    info!("Starting backhaul exposure server");

    let mut registry = ServiceRegistry::new(config.bind_host.clone());
    match config.orchestrator() {
        Some(orchestrator) => {
            info!(app = %config.app_name, "Service hijacking enabled");
            registry = registry.with_orchestrator(orchestrator, config.app_name.clone());
        }
        None => warn!("No orchestration hooks, services will not be hijacked"),
    }
    let registry = Arc::new(registry);

    let link_listener = TcpListener::bind(&config.link)
        .await
        .with_context(|| format!("Failed to bind link address {}", config.link))?;
    let api_listener = TcpListener::bind(&config.api)
        .await
        .with_context(|| format!("Failed to bind API address {}", config.api))?;

    let state = Arc::new(AppState {
        registry: registry.clone(),
    });

    tokio::select! {
        _ = serve_agents(link_listener, registry.clone()) => {}
        result = api::serve(api_listener, state) => {
            if let Err(e) = result {
                error!("Control API failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    registry.shutdown().await;
    info!("Exposure server stopped");

    Ok(())
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Invalid log level")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}
