//! Application orchestrator: provisions storage and runs the upload server.

use std::sync::Arc;

use sluice_server::{ServerConfig, UploadServer};
use sluice_transfer::{FileStorage, SniffingMimeResolver, TracingObserver, UploadContext};

use crate::config::Config;

/// Runs the daemon until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let options = config.upload_options();
    options.validate()?;

    // -- Storage --
    FileStorage::provision(&options.destinations).await?;
    for dir in options.destinations.dirs() {
        tracing::info!(dir = %dir.display(), "upload destination");
    }

    // -- WS server --
    let ctx = UploadContext::new(
        options,
        Arc::new(FileStorage::new()),
        Arc::new(SniffingMimeResolver::new()),
        Arc::new(TracingObserver),
    );
    let server_config = ServerConfig {
        host: config.host,
        port: config.port,
    };
    let server = UploadServer::new(server_config, ctx)?;

    let server_run = Arc::clone(&server);
    let mut serve = tokio::spawn(async move { server_run.run().await });

    // -- Main loop: wait for shutdown --
    tokio::select! {
        result = &mut serve => {
            // The server only stops on its own when it cannot listen.
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    // -- Graceful shutdown --
    server.shutdown();
    serve.await??;
    Ok(())
}
