//! sluice upload daemon entry point.
//!
//! Usage: `sluice [CONFIG_PATH]`. Without a path the platform default is
//! used and created on first start.

mod app;
mod config;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting sluice daemon");

    // Load configuration.
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = config::Config::load(path)?;
    tracing::info!(port = config.port, "configuration loaded");

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("daemon shut down cleanly");
    Ok(())
}
