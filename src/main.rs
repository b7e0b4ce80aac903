use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use teecache::config::Cli;
use teecache::{Proxy, Server, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; the environment may already be set.
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    logging::init(cli.log_format)?;

    let config = cli.into_config().context("invalid configuration")?;
    info!(
        origin = %config.origin.authority(),
        cache_dir = %config.cache_dir.display(),
        "configuration loaded"
    );

    let server = Server::bind(&config.listen_addr).await?;
    Proxy::from_config(&config)
        .serve(server, shutdown_signal())
        .await?;

    info!("teecache stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
