//! Owns every Batch keyed by compatibility, admits newly pending components,
//! ticks dispatch and completion, and runs the adaptive failure backoff.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::batch::Batch;
use crate::cfs::Cfs;
use crate::component::Component;
use crate::OptionsSnapshot;

const RECENT_SESSIONS_SIZE: usize = 20;
const STARTING_BACKOFF: Duration = Duration::from_secs(60);

/// Sessions this agent owns are named `"batcher-" + uuidv4`; this prefix is the
/// sole marker used to identify them on restart.
pub const SESSION_NAME_PREFIX: &str = "batcher-";

pub struct BatchManager {
    batches: BTreeMap<String, Vec<Batch>>,
    active_components: HashSet<String>,
    recent_sessions: VecDeque<bool>,
    current_backoff: Duration,
    backoff_start: Instant,
}

impl BatchManager {
    /// Rebuilds in-flight state from live CFS sessions tagged with this agent's
    /// prefix. Blocks, retrying once a second, until CFS is reachable — this never
    /// fails outright, so a CFS outage at startup just delays the first tick.
    pub async fn new<C: Cfs + ?Sized>(cfs: &C) -> Self {
        let mut manager = Self {
            batches: BTreeMap::new(),
            active_components: HashSet::new(),
            recent_sessions: VecDeque::from(vec![true; RECENT_SESSIONS_SIZE]),
            current_backoff: Duration::ZERO,
            backoff_start: Instant::now(),
        };
        manager.rebuild_state(cfs).await;
        manager
    }

    async fn rebuild_state<C: Cfs + ?Sized>(&mut self, cfs: &C) {
        let sessions = loop {
            match cfs.list_sessions().await {
                Ok(sessions) => break sessions,
                Err(err) => {
                    info!(error = %err, "CFS unreachable during startup; waiting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        let mut rebuilt = 0usize;
        for session in &sessions {
            let status = session.status.session.status.to_lowercase();
            if !session.name.starts_with(SESSION_NAME_PREFIX) || status == "complete" {
                continue;
            }
            let Some(batch) = Batch::rebuild_from_session(cfs, session).await else {
                continue;
            };
            let Some(key) = batch.filing_key() else {
                continue;
            };
            for id in batch.member_ids() {
                self.active_components.insert(id.to_string());
            }
            self.batches.entry(key).or_default().push(batch);
            rebuilt += 1;
        }
        if rebuilt > 0 {
            info!(rebuilt, "rebuilt previous state from in-flight CFS sessions");
        }
    }

    /// Pulls every component CFS reports as pending and either folds it into an
    /// existing compatible batch or starts a new one.
    pub async fn admit<C: Cfs + ?Sized>(&mut self, cfs: &C, options: &OptionsSnapshot) {
        let pending = match cfs.list_pending_components().await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "failed to list pending components; retrying next tick");
                return;
            }
        };

        let mut admitted = 0usize;
        for raw in pending {
            let component = Component::from_raw(raw, false);
            if self.active_components.contains(&component.id) {
                continue;
            }
            self.active_components.insert(component.id.clone());

            let key = component.batch_key.clone();
            let batches = self.batches.entry(key).or_default();
            let mut placed = false;
            for batch in batches.iter_mut() {
                if batch.try_add(component.clone(), options) {
                    placed = true;
                    break;
                }
            }
            if !placed {
                batches.push(Batch::new(component));
            }
            admitted += 1;
        }
        if admitted > 0 {
            tracing::debug!(admitted, "admitted components into batches");
        }
    }

    /// Sends every batch that's ready to go, unless adaptive backoff is in effect.
    pub async fn dispatch<C: Cfs + ?Sized>(&mut self, cfs: &C, options: &OptionsSnapshot) {
        if self.backoff() {
            return;
        }
        let mut sent = 0usize;
        for batches in self.batches.values_mut() {
            for batch in batches.iter_mut() {
                if batch.try_send(cfs, options).await {
                    sent += 1;
                }
            }
        }
        if sent > 0 {
            info!(sent, "submitted batches for configuration");
        }
    }

    /// Polls every in-flight batch for completion, retires finished ones, and
    /// feeds their outcome into the adaptive backoff.
    pub async fn check_status<C: Cfs + ?Sized>(&mut self, cfs: &C, options: &OptionsSnapshot) {
        let mut completed = 0usize;
        let mut empty_keys = Vec::new();

        for (key, batches) in self.batches.iter_mut() {
            let mut remaining = Vec::with_capacity(batches.len());
            for mut batch in std::mem::take(batches) {
                let (complete, success) = batch.check_complete(cfs, options).await;
                if complete {
                    for id in batch.member_ids() {
                        self.active_components.remove(id);
                    }
                    push_ring(&mut self.recent_sessions, success);
                    completed += 1;
                } else {
                    remaining.push(batch);
                }
            }
            if remaining.is_empty() {
                empty_keys.push(key.clone());
            } else {
                *batches = remaining;
            }
        }
        for key in empty_keys {
            self.batches.remove(&key);
        }

        if completed > 0 {
            info!(completed, "batches/sessions have completed");
            self.update_backoff(options);
        }
    }

    /// Doubles (or starts) the backoff window when the whole recent-sessions ring
    /// is failures, and resets it to zero immediately on any recorded success.
    fn update_backoff(&mut self, options: &OptionsSnapshot) {
        if self.recent_sessions.iter().any(|&succeeded| succeeded) {
            if self.current_backoff != Duration::ZERO {
                self.current_backoff = Duration::ZERO;
                info!("a session has succeeded; resuming normal operation");
            }
            return;
        }
        if self.backoff_start.elapsed() >= self.current_backoff {
            self.current_backoff = if self.current_backoff == Duration::ZERO {
                STARTING_BACKOFF.min(options.max_backoff)
            } else {
                (self.current_backoff * 2).min(options.max_backoff)
            };
            warn!(
                backoff_s = self.current_backoff.as_secs(),
                "recent configuration sessions have all failed; halting session creation"
            );
            self.backoff_start = Instant::now();
        }
    }

    /// Whether dispatch should be suppressed because we're still inside the
    /// current backoff window.
    fn backoff(&self) -> bool {
        self.backoff_start.elapsed() < self.current_backoff
    }

    /// Number of components currently held across every in-flight or forming batch.
    pub fn batch_count(&self) -> usize {
        self.batches.values().flatten().map(Batch::len).sum()
    }

    /// Whether `id` is already claimed by a batch (admitted but not yet reconciled).
    pub fn is_active(&self, id: &str) -> bool {
        self.active_components.contains(id)
    }
}

fn push_ring(ring: &mut VecDeque<bool>, value: bool) {
    ring.push_back(value);
    if ring.len() > RECENT_SESSIONS_SIZE {
        ring.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_max() {
        let mut manager = BatchManager {
            batches: BTreeMap::new(),
            active_components: HashSet::new(),
            recent_sessions: VecDeque::from(vec![false; RECENT_SESSIONS_SIZE]),
            current_backoff: Duration::ZERO,
            backoff_start: Instant::now() - Duration::from_secs(3600),
        };
        let mut options = OptionsSnapshot::default();
        options.max_backoff = Duration::from_secs(200);

        manager.update_backoff(&options);
        assert_eq!(manager.current_backoff, Duration::from_secs(60));

        manager.backoff_start = Instant::now() - Duration::from_secs(3600);
        manager.update_backoff(&options);
        assert_eq!(manager.current_backoff, Duration::from_secs(120));

        manager.backoff_start = Instant::now() - Duration::from_secs(3600);
        manager.update_backoff(&options);
        assert_eq!(manager.current_backoff, Duration::from_secs(200), "capped at max_backoff");
    }

    #[test]
    fn single_success_resets_backoff() {
        let mut manager = BatchManager {
            batches: BTreeMap::new(),
            active_components: HashSet::new(),
            recent_sessions: VecDeque::from(vec![false; RECENT_SESSIONS_SIZE]),
            current_backoff: Duration::from_secs(240),
            backoff_start: Instant::now(),
        };
        manager.recent_sessions = std::iter::repeat(false)
            .take(RECENT_SESSIONS_SIZE - 1)
            .chain(std::iter::once(true))
            .collect();
        let options = OptionsSnapshot::default();
        manager.update_backoff(&options);
        assert_eq!(manager.current_backoff, Duration::ZERO);
    }
}
