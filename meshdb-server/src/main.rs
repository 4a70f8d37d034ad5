use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use meshdb_server::config::Cli;

fn main() -> Result<()> {
    // Use JSON logs in production (MESHDB_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("MESHDB_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("meshdb_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = Cli::parse().into_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.io_workers.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: meshdb_server::NodeConfig) -> Result<()> {
    tracing::info!(listen = %config.listen, peers = config.peers.len(), "starting meshdb node");

    let core = meshdb_server::Core::create(config).await?;
    core.listen().await?;
    core.connect();

    tokio::signal::ctrl_c().await?;
    core.shutdown().await;
    Ok(())
}
