//! Task runner: pops one task description, starts its coordinator, and
//! drives it until the task reaches a terminal state. With `--sim` the
//! whole simulation environment (gateway, synthetic feed, side services)
//! runs in-process against the in-memory bus.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use slicer::gateway::{SimFeed, SimGateway};
use slicer::persistence::SnapshotStore;
use slicer::report::NoopReportSink;
use slicer::services::{BalanceService, OrderService};
use slicer::{AppConfig, Bus, Coordinator, InMemoryBus, Task};

#[derive(Debug, Parser)]
#[command(name = "slicer", about = "Algorithmic execution engine")]
struct Cli {
    /// Task description file (JSON)
    #[arg(long)]
    task: PathBuf,

    /// Configuration directory
    #[arg(long, default_value = "config")]
    config: PathBuf,

    /// Run the full simulation environment in-process
    #[arg(long)]
    sim: bool,
}

fn init_tracing(cfg: &AppConfig, task_id: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.clone()));
    if cfg.logging.dir.is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return None;
    }
    let appender =
        tracing_appender::rolling::daily(&cfg.logging.dir, format!("{task_id}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Arc::new(AppConfig::load_from(&cli.config).context("loading configuration")?);

    let raw = std::fs::read_to_string(&cli.task)
        .with_context(|| format!("reading task file {}", cli.task.display()))?;
    let task: Task = serde_json::from_str(&raw).context("parsing task description")?;
    let _guard = init_tracing(&cfg, &task.task_id);
    info!(task_id = %task.task_id, "task accepted");

    let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());

    if cli.sim || task.test_mode {
        let gateway = SimGateway::new(cfg.clone());
        let gateway_bus = bus.clone();
        tokio::spawn(async move { gateway.run(gateway_bus).await });

        let feed = SimFeed::new(cfg.clone());
        let feed_bus = bus.clone();
        tokio::spawn(async move { feed.run(feed_bus).await });

        let balance_service = BalanceService::new(cfg.clone());
        let balance_bus = bus.clone();
        tokio::spawn(async move { balance_service.run(balance_bus).await });

        let order_service = OrderService::new(cfg.clone());
        let order_bus = bus.clone();
        tokio::spawn(async move { order_service.run(order_bus).await });
    }

    let store = SnapshotStore::new(&cfg.orders_dir);
    let coordinator = Coordinator::new(
        cfg.clone(),
        task,
        store,
        Box::new(NoopReportSink),
        None,
    );

    tokio::select! {
        result = coordinator.run(bus) => {
            if let Err(e) = &result {
                error!(error = %e, "coordinator stopped with an error");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }
    Ok(())
}
