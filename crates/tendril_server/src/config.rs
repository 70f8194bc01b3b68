//! Server configuration file handling
//!
//! The server reads a single `tendril.toml`. Every field is optional:
//!
//! ```toml
//! bind_addr = "0.0.0.0:8080"
//! log_filter = "tendril_server=debug,info"
//! artifacts_dir = "dist"
//!
//! [session]
//! heartbeat_interval_ms = 1000
//! destroy_after_missed = 30
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::session::SessionConfig;

/// Top-level server configuration
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,
    /// Fallback `tracing` filter when `RUST_LOG` is unset
    pub log_filter: String,
    /// Directory holding the build output; nothing is preloaded when unset
    pub artifacts_dir: Option<PathBuf>,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            log_filter: "info".to_string(),
            artifacts_dir: None,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize server config")
    }

    /// Artifacts directory resolved against `base` when relative
    pub fn artifacts_dir_in(&self, base: &Path) -> Option<PathBuf> {
        self.artifacts_dir.as_ref().map(|dir| {
            if dir.is_relative() {
                base.join(dir)
            } else {
                dir.clone()
            }
        })
    }
}
