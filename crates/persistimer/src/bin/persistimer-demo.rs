//! Timer manager demo binary.
//!
//! Registers a handful of timers, prints each notification as it fires, and
//! stops once all of them have been delivered.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use persistimer::{ManagerConfig, SurrealStoreConfig, SurrealTimerStore, Timer, TimerManager};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "persistimer-demo", about = "Fire a batch of persistent timers")]
struct Args {
    /// Store connection URL
    #[arg(long, default_value = "mem://")]
    url: String,

    /// Timer namespace
    #[arg(long, default_value = "demo")]
    namespace: String,

    /// Notification queue capacity
    #[arg(long, default_value_t = 128)]
    capacity: usize,

    /// Manager configuration file (TOML); overrides namespace and capacity
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of timers to register
    #[arg(long, default_value_t = 3)]
    timers: u32,

    /// Seconds between consecutive deadlines
    #[arg(long, default_value_t = 2)]
    spacing_secs: u64,
}

fn load_config(args: &Args) -> anyhow::Result<ManagerConfig> {
    match &args.config {
        Some(path) => {
            let document = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(ManagerConfig::from_toml_str(&document)?)
        }
        None => Ok(ManagerConfig::new(args.namespace.clone(), args.capacity)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let store = SurrealTimerStore::connect(SurrealStoreConfig::default().with_url(&args.url))
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    let manager = TimerManager::with_config(config, Arc::new(store))?;
    let notifications = manager.notifications();

    for n in 1..=args.timers {
        let delay = Duration::from_secs(args.spacing_secs.saturating_mul(u64::from(n)));
        let timer = Timer::after(format!("demo-{n}"), format!("payload #{n}"), delay)?;
        manager.add_timer(&timer).await?;
        info!(timer_id = %timer.id(), deadline = %timer.deadline(), "Registered timer");
    }

    let mut remaining = args.timers;
    while remaining > 0 {
        let Some(timer) = notifications.recv().await else {
            break;
        };
        println!("{} fired: {}", timer.id(), timer.context());
        remaining = remaining.saturating_sub(1);
    }

    let stats = serde_json::to_string(&manager.stats())?;
    info!(stats = %stats, "All timers fired");
    manager.stop().await;
    Ok(())
}
