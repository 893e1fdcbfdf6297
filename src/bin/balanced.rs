//! Balance query side service.
//!
//! Runs the service loop against the shared bus. The in-memory bus is the
//! in-process transport of the simulation environment; deployments with
//! an external broker link their own `Bus` implementation.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use slicer::services::BalanceService;
use slicer::{AppConfig, Bus, InMemoryBus};

#[derive(Debug, Parser)]
#[command(name = "balanced", about = "Balance query side service")]
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
    BalanceService::new(cfg).run(bus).await?;
    Ok(())
}
