//! Parallax server entry point.
//!
//! Serves the tool surface over line-delimited stdio JSON-RPC (default) or
//! HTTP with a per-job SSE event stream.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;

use parallax::server::{http, stdio};
use parallax::{OrchestratorConfig, Services, ToolSurface};

#[derive(Parser)]
#[command(name = "parallax-server")]
#[command(about = "Parallel multi-model LLM research orchestrator")]
#[command(version)]
struct Cli {
    /// Serve HTTP on this address instead of stdio (e.g. 127.0.0.1:8385)
    #[arg(long)]
    http: Option<String>,

    /// Data directory (overrides PARALLAX_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    // On stdio the protocol owns stdout; logs go to stderr.
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let mut config = OrchestratorConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.report_output_path = dir.join("reports");
        config.data_dir = dir;
    }

    let services = Services::build(config).await?;
    let surface = Arc::new(ToolSurface::new(services));

    match cli.http {
        Some(addr) => http::serve(surface, &addr).await?,
        None => stdio::run(surface).await?,
    }
    Ok(())
}
