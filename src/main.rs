//! The outer periodic driver: refreshes options, adjusts the log level, ticks the
//! batching engine in `checkStatus → admit → dispatch` order, and touches liveness.

mod config;

use std::time::Duration;

use clap::Parser;
use eyre::Result;
use tokio::sync::watch;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter, Registry};

use cfs_batcher::cfs::CfsClient;
use cfs_batcher::liveness::spawn_heartbeat;
use cfs_batcher::{BatchManager, OptionsCache, OptionsSnapshot};
use config::{Args, DriverConfig};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg: DriverConfig = args.into();

    let reload_handle = init_logging(&cfg.initial_log_level);

    tracing::info!(
        cfs_base_url = %cfg.cfs_base_url,
        dry_run = cfg.dry_run,
        once = cfg.once,
        timestamp_path = %cfg.timestamp_path.display(),
        "cfs-batcher starting"
    );

    let cfs = CfsClient::new(cfg.cfs_base_url.clone(), cfg.dry_run);

    // Heartbeat runs as an independently scheduled task, communicating with the
    // driver only through this watch channel and the liveness file.
    let (alive_tx, alive_rx) = watch::channel(true);
    let heartbeat = spawn_heartbeat(cfg.timestamp_path.clone(), alive_rx);

    let mut options = OptionsCache::new();
    // Blocks, retrying once a second, until CFS is reachable.
    let mut manager = BatchManager::new(&cfs).await;

    loop {
        tick(&cfs, &mut options, &mut manager, &reload_handle).await;

        if cfg.once {
            break;
        }

        let interval = options.snapshot().check_interval;
        tokio::time::sleep(interval).await;
    }

    let _ = alive_tx.send(false);
    let _ = heartbeat.await;
    Ok(())
}

/// One pass of the per-tick flow: `options.refresh → checkStatus → (if !disable)
/// admit → dispatch`. Any unexpected error from this body is caught by the
/// caller, which sleeps 5s before continuing.
async fn tick(
    cfs: &CfsClient,
    options: &mut OptionsCache,
    manager: &mut BatchManager,
    reload_handle: &FilterHandle,
) {
    if let Err(err) = run_tick(cfs, options, manager, reload_handle).await {
        tracing::error!(error = %err, "unexpected error in tick; backing off");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn run_tick(
    cfs: &CfsClient,
    options: &mut OptionsCache,
    manager: &mut BatchManager,
    reload_handle: &FilterHandle,
) -> Result<()> {
    // A failed refresh keeps the prior snapshot and does not abort the tick; options
    // are best-effort, not a precondition for running one.
    if let Err(err) = options.refresh(cfs).await {
        tracing::error!(error = %err, "failed to refresh options from CFS; using last snapshot");
    }
    let snapshot: OptionsSnapshot = options.snapshot();

    apply_log_level(reload_handle, &snapshot.logging_level);

    manager.check_status(cfs, &snapshot).await;
    if !snapshot.disable {
        manager.admit(cfs, &snapshot).await;
        manager.dispatch(cfs, &snapshot).await;
    }
    Ok(())
}

fn init_logging(initial_level: &str) -> FilterHandle {
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(normalize_level(initial_level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    reload_handle
}

fn apply_log_level(reload_handle: &FilterHandle, level: &str) {
    if let Err(err) = reload_handle.modify(|f| *f = EnvFilter::new(normalize_level(level))) {
        tracing::warn!(error = %err, "failed to apply updated logging level");
    }
}

fn normalize_level(level: &str) -> String {
    level.to_lowercase()
}
