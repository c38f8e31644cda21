use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod middleware;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "geoscope")]
#[command(about = "Generative-engine visibility analysis over MCP", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "GEOSCOPE_CONFIG", default_value = "geoscope.toml")]
    config: PathBuf,

    /// Port to listen on (overrides [server] port)
    #[arg(short, long, env = "GEOSCOPE_PORT")]
    port: Option<u16>,

    /// Host to bind to (overrides [server] host)
    #[arg(long, env = "GEOSCOPE_HOST")]
    host: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }

    tracing::info!("Starting Geoscope");

    // Load configuration
    let mut config = ServerConfig::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Start API server
    let addr = config.listen_addr();
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}
