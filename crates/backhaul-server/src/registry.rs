//! Service registry
//!
//! Owns the port and token indexes of live services. Both maps always hold
//! the same set of services: entries are inserted and removed as a pair
//! under a single lock.

use crate::orchestrator::{OrchestrationError, Orchestrator};
use crate::service::Service;
use crate::token::generate_token;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Upper bound for a hijack hook
pub const HIJACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a restore hook
pub const RESTORE_TIMEOUT: Duration = Duration::from_secs(15);

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Orchestration failed: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Snapshot of a live service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub port: u16,
    pub token: String,
    pub agents: usize,
}

#[derive(Default)]
struct Maps {
    by_port: HashMap<u16, Arc<Service>>,
    by_token: HashMap<String, Arc<Service>>,
}

/// Registry of exposed services
pub struct ServiceRegistry {
    bind_host: String,
    app_name: String,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    maps: Mutex<Maps>,
}

impl ServiceRegistry {
    /// Create a registry whose services bind on `bind_host`
    pub fn new(bind_host: impl Into<String>) -> Self {
        Self {
            bind_host: bind_host.into(),
            app_name: String::new(),
            orchestrator: None,
            maps: Mutex::new(Maps::default()),
        }
    }

    /// Run `orchestrator` around listen and revoke, routing hijacked
    /// services to `app_name`
    pub fn with_orchestrator(
        mut self,
        orchestrator: Arc<dyn Orchestrator>,
        app_name: impl Into<String>,
    ) -> Self {
        self.orchestrator = Some(orchestrator);
        self.app_name = app_name.into();
        self
    }

    fn maps(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expose `port` as service `name`.
    ///
    /// Port 0 binds an ephemeral port; the returned service carries the
    /// port actually bound. Nothing stays registered if binding or the
    /// hijack hook fails.
    pub async fn listen(&self, name: &str, port: u16) -> Result<Arc<Service>, RegistryError> {
        let listener = TcpListener::bind((self.bind_host.as_str(), port))
            .await
            .map_err(|e| RegistryError::BindError {
                address: self.bind_host.clone(),
                port,
                reason: e.to_string(),
            })?;
        let port = listener.local_addr()?.port();

        let service = {
            let mut maps = self.maps();
            if maps.by_port.contains_key(&port) {
                return Err(RegistryError::BindError {
                    address: self.bind_host.clone(),
                    port,
                    reason: "port already exposed".to_string(),
                });
            }

            let mut token = generate_token();
            while maps.by_token.contains_key(&token) {
                token = generate_token();
            }

            let service = Service::start(name.to_string(), token.clone(), port, listener);
            maps.by_port.insert(port, service.clone());
            maps.by_token.insert(token, service.clone());
            service
        };

        info!(service = %name, port, token = %service.token(), "Service listening");

        if let Some(orchestrator) = &self.orchestrator {
            let hijacked =
                tokio::time::timeout(HIJACK_TIMEOUT, orchestrator.hijack(name, &self.app_name, port))
                    .await
                    .unwrap_or(Err(OrchestrationError::Timeout(HIJACK_TIMEOUT)));

            if let Err(e) = hijacked {
                error!(service = %name, port, "Hijack failed, rolling back: {}", e);
                // Nothing was hijacked, so there is nothing to restore
                self.revoke(service.token(), false).await;
                return Err(e.into());
            }
        }

        Ok(service)
    }

    /// Tear down the service owning `token`, optionally restoring routing.
    ///
    /// Unknown tokens are ignored.
    pub async fn revoke(&self, token: &str, restore: bool) {
        let service = {
            let mut maps = self.maps();
            let service = maps.by_token.remove(token);
            if let Some(service) = &service {
                maps.by_port.remove(&service.port());
            }
            service
        };

        let Some(service) = service else {
            debug!(%token, "Revoke for unknown token");
            return;
        };

        info!(service = %service.name(), port = service.port(), %token, "Revoking service");

        // The service is out of the maps already; finish tearing it down even
        // if our caller goes away
        let orchestrator = self.orchestrator.clone().filter(|_| restore);
        let teardown = tokio::spawn(async move {
            if let Some(orchestrator) = orchestrator {
                let restored =
                    tokio::time::timeout(RESTORE_TIMEOUT, orchestrator.restore(service.name()))
                        .await
                        .unwrap_or(Err(OrchestrationError::Timeout(RESTORE_TIMEOUT)));
                if let Err(e) = restored {
                    warn!(service = %service.name(), "Failed to restore service routing: {}", e);
                }
            }
            service.close().await;
        });

        if let Err(e) = teardown.await {
            error!(%token, "Service teardown failed: {}", e);
        }
    }

    /// Token and name of the service exposing `port`
    pub fn lookup_port(&self, port: u16) -> Option<(String, String)> {
        self.maps()
            .by_port
            .get(&port)
            .map(|s| (s.token().to_string(), s.name().to_string()))
    }

    pub fn lookup_token(&self, token: &str) -> Option<Arc<Service>> {
        self.maps().by_token.get(token).cloned()
    }

    /// Live services, ordered by port
    pub fn services(&self) -> Vec<ServiceInfo> {
        let mut services: Vec<ServiceInfo> = self
            .maps()
            .by_port
            .values()
            .map(|s| ServiceInfo {
                name: s.name().to_string(),
                port: s.port(),
                token: s.token().to_string(),
                agents: s.agent_count(),
            })
            .collect();
        services.sort_by_key(|s| s.port);
        services
    }

    pub fn len(&self) -> usize {
        self.maps().by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Revoke every live service without restoring routing
    pub async fn shutdown(&self) {
        let tokens: Vec<String> = self.maps().by_token.keys().cloned().collect();
        for token in tokens {
            self.revoke(&token, false).await;
        }
    }

    #[cfg(test)]
    fn maps_consistent(&self) -> bool {
        let maps = self.maps();
        maps.by_port.len() == maps.by_token.len()
            && maps.by_token.iter().all(|(token, s)| {
                s.token() == token
                    && maps
                        .by_port
                        .get(&s.port())
                        .is_some_and(|p| Arc::ptr_eq(p, s))
            })
    }
}
