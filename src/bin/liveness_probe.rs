//! The liveness probe entrypoint: exits 0 if the liveness timestamp's age is
//! less than `batcherCheckInterval + 30s`, else 1.
//!
//! The probe takes no arguments and never calls CFS, so it compares against the
//! built-in default `batcherCheckInterval` rather than whatever value CFS
//! currently holds.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use cfs_batcher::liveness::Timestamp;
use cfs_batcher::OptionsSnapshot;

const PROBE_SLACK: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "liveness-probe", version, about = "Checks that cfs-batcher's main loop is still executing")]
struct Args {
    #[arg(long, env = "CFS_BATCHER_STATE_DIR", default_value = "/var/run/cfs-batcher")]
    state_dir: PathBuf,
}

impl Args {
    fn timestamp_path(&self) -> PathBuf {
        self.state_dir.join("timestamp")
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let timestamp = Timestamp::new(args.timestamp_path());
    let max_age = OptionsSnapshot::default().check_interval + PROBE_SLACK;

    if timestamp.alive(max_age).await {
        tracing::info!("liveness timestamp is fresh; batcher is alive");
        std::process::exit(0);
    }

    tracing::warn!("liveness timestamp is stale or missing");
    std::process::exit(1);
}
