//! The on-disk liveness timestamp and the background heartbeat that keeps it fresh.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::error;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// A single well-known file containing the numeric wall-clock seconds of the last
/// heartbeat. Written only by the heartbeat task; read only by the external probe
/// (or, in-process, by tests).
pub struct Timestamp {
    path: PathBuf,
}

impl Timestamp {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Writes the current wall-clock time to disk, creating the parent directory
    /// if it doesn't exist yet.
    pub async fn touch(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, now_secs().to_string()).await
    }

    /// How long ago the timestamp was written; a missing or unparsable file reads
    /// as "infinitely old" rather than erroring, so callers treat it as dead.
    pub async fn age(&self) -> Duration {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return Duration::MAX,
        };
        match raw.trim().parse::<f64>() {
            Ok(written) => Duration::from_secs_f64((now_secs() - written).max(0.0)),
            Err(_) => Duration::MAX,
        }
    }

    /// True if the timestamp is newer than `max_age` (the liveness probe's check).
    pub async fn alive(&self, max_age: Duration) -> bool {
        self.age().await < max_age
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Spawns the heartbeat task: writes the liveness timestamp every ~10s while
/// `alive` stays true, and exits once the driver signals it is no longer
/// running, so the external probe can observe staleness promptly.
pub fn spawn_heartbeat(
    path: PathBuf,
    mut alive: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let timestamp = Timestamp::new(path);
        loop {
            if !*alive.borrow() {
                break;
            }
            if let Err(err) = timestamp.touch().await {
                error!(error = %err, "failed to write liveness timestamp");
            }
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                result = alive.changed() => {
                    if result.is_err() || !*alive.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn touch_then_alive_within_window() {
        let dir = std::env::temp_dir().join(format!("cfs-batcher-liveness-test-{}", std::process::id()));
        let path = dir.join("timestamp");
        let ts = Timestamp::new(&path);
        ts.touch().await.unwrap();
        assert!(ts.alive(Duration::from_secs(5)).await);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn missing_file_is_never_alive() {
        let dir = std::env::temp_dir().join(format!("cfs-batcher-liveness-missing-{}", std::process::id()));
        let path = dir.join("timestamp");
        let ts = Timestamp::new(&path);
        assert!(!ts.alive(Duration::from_secs(3600)).await);
    }
}
