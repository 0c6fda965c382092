//! zonesync server - one node of a replicated DNS zone store

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zonesync_core::Node;
use zonesync_core::state_hash::LoggingStateHash;
use zonesync_server::config;

/// zonesync server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "zonesync-server")]
#[command(about = "Replicated DNS zone store node", long_about = None)]
struct Args {
    /// Path to the TOML configuration file (falls back to ZONESYNC_CONFIG)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Enable verbose logging (prints debug information to stdout/stderr)
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("zonesync-worker")
        .enable_all()
        .build()?;

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "zonesync_core=debug,zonesync_server=debug".into())
    } else {
        // Only show errors when not verbose
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "zonesync_core=error,zonesync_server=error".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    rt.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let config = config::load(args.config.as_deref())?;
    info!("Using data directory: {}", config.data_dir.display());

    let node = Node::open(config, Arc::new(LoggingStateHash))?;
    let addr = node.start().await?;
    info!("Node {} replicating on {}", node.name(), addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    node.shutdown().await;
    Ok(())
}
