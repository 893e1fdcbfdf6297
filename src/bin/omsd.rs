//! Order query side service.
//!
//! Answers order/statistics queries for finished tasks from their order
//! snapshots on disk. The in-memory bus is the in-process transport of
//! the simulation environment; deployments with an external broker link
//! their own `Bus` implementation.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use slicer::services::OrderService;
use slicer::{AppConfig, Bus, InMemoryBus};

#[derive(Debug, Parser)]
#[command(name = "omsd", about = "Order query side service")]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Arc::new(AppConfig::load_from(&cli.config).context("loading configuration")?);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.clone())),
        )
        .init();

    let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
    OrderService::new(cfg).run(bus).await?;
    Ok(())
}
