//! CLI surface for the `cfs-batcher` binary. Every tunable is an optional flag
//! with a sensible default and a matching environment variable, rather than
//! requiring an external config file.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cfs-batcher",
    version,
    about = "Batches pending component configuration work into CFS playbook sessions"
)]
pub struct Args {
    /// Base URL of the Configuration Framework Service API.
    #[arg(
        long,
        env = "CFS_BASE_URL",
        default_value = "https://cray-configuration-framework-service-api/v2"
    )]
    pub cfs_base_url: String,

    /// Run a single tick and exit. Useful for smoke-testing and CI.
    #[arg(long)]
    pub once: bool,

    /// Log intended session creation and component patches without calling any of
    /// CFS's mutating endpoints.
    #[arg(long)]
    pub dry_run: bool,

    /// Overrides `CFS_LOG_LEVEL` / the CFS-sourced `loggingLevel` option for the
    /// initial tick only; CFS remains authoritative thereafter.
    #[arg(long, env = "CFS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Directory the liveness timestamp file is written under.
    #[arg(
        long,
        env = "CFS_BATCHER_STATE_DIR",
        default_value = "/var/run/cfs-batcher"
    )]
    pub state_dir: PathBuf,
}

impl Args {
    pub fn timestamp_path(&self) -> PathBuf {
        self.state_dir.join("timestamp")
    }
}

/// The plain, resolved struct the driver actually runs off of, separate from the
/// `clap`-parsed `Args` it's built from.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub cfs_base_url: String,
    pub once: bool,
    pub dry_run: bool,
    pub initial_log_level: String,
    pub timestamp_path: PathBuf,
}

impl From<Args> for DriverConfig {
    fn from(args: Args) -> Self {
        let initial_log_level = args
            .log_level
            .clone()
            .unwrap_or_else(|| "INFO".to_string());
        let timestamp_path = args.timestamp_path();
        Self {
            cfs_base_url: args.cfs_base_url,
            once: args.once,
            dry_run: args.dry_run,
            initial_log_level,
            timestamp_path,
        }
    }
}
