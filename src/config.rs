//! Server configuration.
//!
//! Settings come from built-in defaults, optionally overlaid by a JSON file
//! (`--config` or the `JSEXT_CONFIG` environment variable), then by
//! command-line flags.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::backend::EngineConfig;
use crate::transport::MAX_RECORD_SIZE;

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV: &str = "JSEXT_CONFIG";

/// What happens when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SessionEndPolicy {
    /// Stop the server; the process exits with the session's exit code.
    #[default]
    Exit,
    /// Release the connection and keep accepting new ones.
    Continue,
}

/// Top-level configuration for the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub host: IpAddr,

    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,

    /// Mapping of the session-end event to a server action.
    pub on_session_end: SessionEndPolicy,

    /// Longest accepted request line, in bytes.
    pub max_record_bytes: usize,

    /// Script engine limits.
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            on_session_end: SessionEndPolicy::Exit,
            max_record_bytes: MAX_RECORD_SIZE,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse configuration from a JSON string. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse configuration")?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load from `path` if given, else from the file named by `JSEXT_CONFIG`,
    /// else use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading config file");
            return Self::from_file(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => {
                debug!(path = ?path, "Loading config file from {CONFIG_ENV}");
                Self::from_file(Path::new(&path))
            }
            None => Ok(Self::default()),
        }
    }

    /// Socket address to bind.
    pub const fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
