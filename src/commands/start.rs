use anyhow::Result;
use colored::Colorize;
use dbintel_pipeline::{config, init_tracing, server};
use std::path::Path;
use tracing::info;

/// Execute the start command
///
/// This will:
/// 1. Load and validate configuration (refusing to start on error)
/// 2. Initialize tracing from the logging section
/// 3. Start the server
pub async fn execute(path: Option<&Path>) -> Result<()> {
    let cfg = config::load_config(path)?;
    init_tracing(&cfg.logging);

    println!("{}", "Starting dbintel pipeline...".green());
    info!(
        host = %cfg.server.host,
        port = cfg.server.port,
        "Starting dbintel pipeline"
    );

    // Start the server (blocks until shutdown)
    server::start_server(cfg).await?;

    Ok(())
}
