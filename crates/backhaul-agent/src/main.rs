//! Backhaul Agent - reverse tunnel agent CLI
//!
//! Links an exposed port on the exposure server to a private backend, and
//! manages exposed ports through the control API.

use anyhow::{bail, Context, Result};
use backhaul_agent::{AgentConfig, AgentLink, ApiClient, LinkConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul reverse tunnel agent
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(about = "Backhaul reverse tunnel agent")]
#[command(version)]
#[command(long_about = r#"
Backhaul Agent dials the exposure server and relays traffic for an exposed
public port to a backend in your private network.

EXAMPLES:
  # Expose port 8080 as "web" and print its token
  backhaul-agent --api expose.example.com:7001 listen 8080 web

  # Relay the exposed port to a local backend
  backhaul-agent --link expose.example.com:7000 link $TOKEN 127.0.0.1:3000

  # Remember the addresses for later runs
  backhaul-agent --api expose.example.com:7001 --link expose.example.com:7000 save-config

ENVIRONMENT VARIABLES:
  BACKHAUL_API    Control API address
  BACKHAUL_LINK   Link address
"#)]
struct Cli {
    /// Control API address (e.g., expose.example.com:7001)
    #[arg(long, env = "BACKHAUL_API", global = true)]
    api: Option<String>,

    /// Link address (e.g., expose.example.com:7000)
    #[arg(long, env = "BACKHAUL_LINK", global = true)]
    link: Option<String>,

    /// Settings file (defaults to <config dir>/backhaul/agent.yaml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Relay an exposed service to a local backend
    Link {
        /// Service token returned by `listen`
        token: String,

        /// Backend address (host:port)
        backend: String,

        /// Idle backend connections kept ready
        #[arg(long, default_value_t = 1)]
        backend_conns: usize,

        /// Parallel links to the exposure server
        #[arg(long, default_value_t = 1)]
        links: usize,

        /// Re-dial dropped links
        #[arg(long)]
        reconnect: bool,
    },

    /// Expose a public port as a named service
    Listen {
        port: u16,
        service: String,
    },

    /// Revoke a service token
    Revoke { token: String },

    /// Show the service exposed on a port
    Port { port: u16 },

    /// Save the current API and link addresses
    SaveConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    setup_logging(log_level)?;

    let path = match &cli.config {
        Some(path) => path.clone(),
        None => AgentConfig::default_path()?,
    };
    let settings = AgentConfig::load(&path)?.merge(AgentConfig {
        api: cli.api.clone(),
        link: cli.link.clone(),
    });

    match cli.command {
        Commands::Link {
            token,
            backend,
            backend_conns,
            links,
            reconnect,
        } => {
            let Some(link_addr) = settings.link else {
                bail!("No link address; pass --link or set BACKHAUL_LINK");
            };
            validate_address(&link_addr, "link")?;
            validate_address(&backend, "backend")?;

            run_link(LinkConfig {
                link_addr,
                token,
                backend,
                backend_conns,
                links,
                reconnect,
            })
            .await
        }
        Commands::Listen { port, service } => {
            let token = api_client(&settings)?
                .listen(port, &service)
                .await
                .context("Failed to listen service")?;
            println!("{}", token);
            Ok(())
        }
        Commands::Revoke { token } => {
            api_client(&settings)?
                .revoke(&token)
                .await
                .context("Failed to revoke token")?;
            Ok(())
        }
        Commands::Port { port } => {
            match api_client(&settings)?
                .port(port)
                .await
                .context("Failed to get port")?
            {
                Some((token, name)) => {
                    println!("{}", token);
                    println!("{}", name);
                }
                None => println!("port is not in use"),
            }
            Ok(())
        }
        Commands::SaveConfig => {
            settings.save(&path)?;
            println!("Saved configuration to {}", path.display());
            Ok(())
        }
    }
}

fn api_client(settings: &AgentConfig) -> Result<ApiClient> {
    match &settings.api {
        Some(api) => Ok(ApiClient::new(api)),
        None => bail!("No API address; pass --api or set BACKHAUL_API"),
    }
}

async fn run_link(config: LinkConfig) -> Result<()> {
    info!("Linking {} to backend {}", config.link_addr, config.backend);

    let link = AgentLink::new(config);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = link.run() => {
            if let Err(e) = result {
                error!("Link error: {}", e);
                link.shutdown();
                return Err(e.into());
            }
            info!("Link closed");
        }
    }

    link.shutdown();
    info!("Agent stopped");
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

fn validate_address(addr: &str, name: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("Invalid {} address '{}': expected host:port", name, addr);
    };
    if host.is_empty() {
        bail!("Invalid {} address '{}': missing host", name, addr);
    }
    port.parse::<u16>()
        .with_context(|| format!("Invalid {} address '{}': bad port", name, addr))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("expose.example.com:7000", "link").is_ok());
        assert!(validate_address("127.0.0.1:3000", "backend").is_ok());
        assert!(validate_address("[::1]:3000", "backend").is_ok());

        assert!(validate_address("expose.example.com", "link").is_err());
        assert!(validate_address("expose.example.com:", "link").is_err());
        assert!(validate_address("expose.example.com:abc", "link").is_err());
        assert!(validate_address(":7000", "link").is_err());
        assert!(validate_address("", "backend").is_err());
    }

    #[test]
    fn test_cli_parses_link() {
        let cli = Cli::try_parse_from([
            "backhaul-agent",
            "--link",
            "127.0.0.1:7000",
            "link",
            "tok",
            "127.0.0.1:3000",
            "--backend-conns",
            "4",
            "--reconnect",
        ])
        .unwrap();

        assert_eq!(cli.link.as_deref(), Some("127.0.0.1:7000"));
        match cli.command {
            Commands::Link {
                token,
                backend_conns,
                links,
                reconnect,
                ..
            } => {
                assert_eq!(token, "tok");
                assert_eq!(backend_conns, 4);
                assert_eq!(links, 1);
                assert!(reconnect);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
