use anyhow::{Context, Result};
use geoscope_mcp::server::build_dispatcher;
use geoscope_mcp::{Dispatcher, McpConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,

    /// `[outbound]`, `[cache]`, `[logging]` and `[web]` sections
    #[serde(flatten)]
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let dispatcher = build_dispatcher(&config.mcp).context("Failed to build dispatcher")?;

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
        })
    }
}
