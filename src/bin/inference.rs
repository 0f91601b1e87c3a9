//! Inference process: tick stream, decision cycles, paper portfolio
//!
//! Connects to the trade stream, runs one decision cycle per interval and
//! pushes completed experiences onto the durable queue for the trainer.
//!
//! Usage:
//!   cargo run --release --bin neurotrade-inference -- --symbol btcusdt
//!
//! Environment:
//!   NEUROTRADE_* - overrides for individual config values (see config.rs)
//!   RUST_LOG - log filter (default: neurotrade=info)

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use neurotrade::config::{AppConfig, StrategyKind};
use neurotrade::pipeline::InferencePipeline;
use neurotrade::queue::QueueStore;
use neurotrade::shutdown::Shutdown;
use neurotrade::tick_source::TickSource;

/// Online trading pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file (defaults apply for missing fields)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Trading pair, e.g. btcusdt
    #[arg(short, long)]
    symbol: Option<String>,

    /// Decision strategy: ensemble or learned
    #[arg(long)]
    strategy: Option<StrategyKind>,

    /// SQLite file shared with the trainer
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Model checkpoint polled for updates
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Milliseconds between decision cycles
    #[arg(long)]
    interval_ms: Option<u64>,
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("neurotrade=info".parse()?)
                .add_directive("neurotrade_inference=info".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging()?;
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(symbol) = args.symbol {
        config.symbol = symbol;
    }
    if let Some(strategy) = args.strategy {
        config.decision.strategy = strategy;
    }
    if let Some(path) = args.db_path {
        config.queue.db_path = path;
    }
    if let Some(path) = args.model_path {
        config.model.path = path;
    }
    if let Some(ms) = args.interval_ms {
        config.cycle_interval_ms = ms;
    }
    config.validate()?;

    info!("═══════════════════════════════════════════════════════");
    info!("NEUROTRADE INFERENCE");
    info!("═══════════════════════════════════════════════════════");
    info!("   Symbol: {}", config.symbol.to_uppercase());
    info!("   Strategy: {:?}", config.decision.strategy);
    info!("   Stream: {}", config.tick_source.stream_url(&config.symbol));
    info!("   Cycle: {} ms | min ticks: {}", config.cycle_interval_ms, config.min_ticks);
    info!(
        "   Cash: {:.2} | fee {:.4} | slippage {:.4}",
        config.portfolio.initial_cash,
        config.portfolio.trade_fee_rate,
        config.portfolio.slippage_rate
    );
    info!("   Queue: {}", config.queue.db_path.display());
    info!("   Model: {}", config.model.path.display());
    info!("═══════════════════════════════════════════════════════");

    let store = Arc::new(QueueStore::open(&config.queue.db_path)?);
    let ticks = TickSource::new(config.tick_source.max_ticks);
    let shutdown = Shutdown::new();

    let feed = {
        let ticks = ticks.clone();
        let source_config = config.tick_source.clone();
        let symbol = config.symbol.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { ticks.run(&source_config, &symbol, shutdown).await })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                return;
            }
            info!("Interrupt received, finishing current cycle");
            shutdown.trigger();
        });
    }

    let mut pipeline = InferencePipeline::new(config, ticks, store);
    let result = pipeline.run(shutdown.clone()).await;
    shutdown.trigger();
    if let Err(e) = feed.await {
        warn!("Tick feed task ended abnormally: {}", e);
    }
    result
}
