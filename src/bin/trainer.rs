//! Training process: consume experiences, train, write checkpoints
//!
//! Usage:
//!   cargo run --release --features rl --bin neurotrade-trainer
//!
//! Requires the `rl` feature (libtorch); without it the trainer exits with an
//! error at startup.
//!
//! Environment:
//!   NEUROTRADE_* - overrides for individual config values (see config.rs)
//!   RUST_LOG - log filter (default: neurotrade=info)

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use neurotrade::config::AppConfig;
use neurotrade::queue::QueueStore;
use neurotrade::rl::DqnTrainer;
use neurotrade::shutdown::Shutdown;

/// DQN trainer fed by the inference process
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file (defaults apply for missing fields)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite file shared with the inference process
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Checkpoint written every save interval
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Mini-batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// RNG seed for initialization and sampling
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("neurotrade=info".parse()?)
                .add_directive("neurotrade_trainer=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(path) = args.db_path {
        config.queue.db_path = path;
    }
    if let Some(path) = args.model_path {
        config.model.path = path;
    }
    if let Some(batch) = args.batch_size {
        config.trainer.batch_size = batch;
    }
    config.validate()?;

    let t = &config.trainer;
    info!("═══════════════════════════════════════════════════════");
    info!("NEUROTRADE TRAINER");
    info!("═══════════════════════════════════════════════════════");
    info!("   Queue: {} ({})", config.queue.db_path.display(), config.queue.experience_key);
    info!("   Model: {} hidden={:?}", config.model.path.display(), config.model.hidden_layers);
    info!("   Replay: {} | batch {} | warmup {}", t.replay_capacity, t.batch_size, t.train_after);
    info!(
        "   gamma {} | lr {} | target sync {} | save {}",
        t.gamma, t.learning_rate, t.target_sync_interval, t.save_interval
    );
    info!("═══════════════════════════════════════════════════════");

    let store = Arc::new(QueueStore::open(&config.queue.db_path)?);
    let mut trainer = DqnTrainer::new(&config.trainer, &config.model, args.seed)?;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                return;
            }
            info!("Interrupt received, stopping trainer");
            shutdown.trigger();
        });
    }

    trainer.run(store, &config.queue.experience_key, shutdown).await
}
