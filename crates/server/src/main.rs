use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;

use config::ServerConfig;

/// Log filter applied when RUST_LOG is unset.
const DEFAULT_LOG_FILTER: &str =
    "vericorp_core=info,vericorp_mcp=info,vericorp_mcp_server=info,tower_http=debug";

#[derive(Parser, Debug)]
#[command(name = "vericorp-mcp-server")]
#[command(about = "MCP server for European company verification via VeriCorp API", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "vericorp.toml")]
    config: PathBuf,

    /// Data directory for the counter store
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Secret expected by the VeriCorp upstream proxy
    #[arg(long, env = "RAPIDAPI_PROXY_SECRET", hide_env_values = true)]
    proxy_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting VeriCorp MCP server");
    tracing::info!("Data directory: {}", args.data_dir.display());

    // Load configuration
    let mut config = ServerConfig::load(&args.config, args.data_dir)?;

    // A secret given on the command line or environment wins over the file
    if let Some(secret) = args.proxy_secret {
        config.upstream.proxy_secret = secret;
    }

    // Start API server
    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}
