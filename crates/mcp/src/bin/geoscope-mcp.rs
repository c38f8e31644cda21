// Standalone MCP server binary (stdio)

use anyhow::Result;
use geoscope_mcp::config::{McpConfig, CONFIG_ENV, DEFAULT_CONFIG_FILE};
use geoscope_mcp::McpServer;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::info!("Geoscope MCP server starting...");

    let config_path = std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = McpConfig::load(&config_path)?;

    let server = McpServer::from_config(&config)?;
    server.start().await?;

    tracing::info!("Client disconnected, shutting down");
    Ok(())
}
