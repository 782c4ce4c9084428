//! Per-user agent settings
//!
//! Stored as YAML in `<config dir>/backhaul/agent.yaml`. Environment
//! variables and command-line flags take precedence over the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Saved agent settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Control API address
    pub api: Option<String>,
    /// Link address
    pub link: Option<String>,
}

impl AgentConfig {
    /// Default settings file location
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Failed to get config directory")?;
        Ok(dir.join("backhaul").join("agent.yaml"))
    }

    /// Load settings; a missing file yields empty settings
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Write settings, creating the parent directory as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(path, yaml).with_context(|| format!("Failed to write config file: {:?}", path))
    }

    /// Values set in `overrides` win over the ones in `self`
    pub fn merge(self, overrides: AgentConfig) -> Self {
        Self {
            api: overrides.api.or(self.api),
            link: overrides.link.or(self.link),
        }
    }
}
