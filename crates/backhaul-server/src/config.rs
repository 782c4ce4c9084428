//! Exposure server configuration file

use crate::orchestrator::{ExecOrchestrator, HookCommand, Orchestrator};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/expose.yaml";

/// Exposure server settings, as read from YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposeConfig {
    /// Address agents dial
    pub link: String,
    /// Control API address
    pub api: String,
    /// Host that exposed service ports bind on
    pub bind_host: String,
    /// Name hijacked services are routed to
    pub app_name: String,
    pub log_level: String,
    /// Skip orchestration even when hooks are configured
    pub no_hijack: bool,
    pub hooks: HooksConfig,
}

/// Programs run on hijack and restore
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HooksConfig {
    pub hijack: Option<HookCommand>,
    pub restore: Option<HookCommand>,
}

impl Default for ExposeConfig {
    fn default() -> Self {
        Self {
            link: "0.0.0.0:7000".to_string(),
            api: "127.0.0.1:7001".to_string(),
            bind_host: "0.0.0.0".to_string(),
            app_name: "backhaul-expose".to_string(),
            log_level: "info".to_string(),
            no_hijack: false,
            hooks: HooksConfig::default(),
        }
    }
}

impl ExposeConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults
    /// unless `required` is set
    pub fn load_or_default(path: &Path, required: bool) -> Result<Self> {
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Orchestrator for the configured hooks, if orchestration is enabled
    pub fn orchestrator(&self) -> Option<Arc<dyn Orchestrator>> {
        if self.no_hijack || (self.hooks.hijack.is_none() && self.hooks.restore.is_none()) {
            return None;
        }
        Some(Arc::new(ExecOrchestrator::new(
            self.hooks.hijack.clone(),
            self.hooks.restore.clone(),
        )))
    }
}
