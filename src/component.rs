//! In-memory projection of a CFS component. Never mutated in place: reconciliation
//! always constructs a fresh projection from a new CFS read and compares it against
//! the pre-dispatch snapshot.

use crate::cfs::components::{ComponentPatch, RawComponent, StateAppend};
use crate::cfs::{Cfs, CfsError};
use crate::OptionsSnapshot;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

const PENDING: &str = "pending";

#[derive(Debug, Clone)]
pub struct Component {
    pub id: String,
    pub error_count: u32,
    pub tags: BTreeMap<String, String>,
    pub config_name: String,
    /// Retained only when constructed with `retain_desired_state = true`; bounds
    /// memory for the long-lived copies BatchManager holds between ticks.
    pub desired_state: Option<Vec<crate::cfs::components::RawLayer>>,
    pub config_limit: String,
    pub latest_status: String,
    pub latest_timestamp: String,
    pub desired_state_fingerprint: u64,
    pub batch_key: String,
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Component {}

impl Hash for Component {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Component {
    /// Projects a raw CFS document. `retain_desired_state` keeps the full layer
    /// list around for later status writeback (reconciliation snapshots); the
    /// copies BatchManager files away under a batch key drop it.
    pub fn from_raw(raw: RawComponent, retain_desired_state: bool) -> Self {
        let config_name = raw
            .desired_config
            .as_ref()
            .map(|c| c.name.clone())
            .unwrap_or_default();

        let pending_indices: Vec<usize> = raw
            .desired_state
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.status.as_deref() == Some(PENDING) || layer.status.is_none())
            .map(|(i, _)| i)
            .collect();

        let config_limit = if pending_indices.len() == raw.desired_state.len() {
            // All layers pending (including the degenerate empty-desired-state case):
            // empty sentinel whenever every layer is pending, regardless of layer count.
            String::new()
        } else {
            pending_indices
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };

        let (latest_status, latest_timestamp) = raw
            .state
            .last()
            .map(|e| (e.status.clone(), e.last_updated.clone().unwrap_or_default()))
            .unwrap_or_default();

        let mut hasher = DefaultHasher::new();
        for layer in &raw.desired_state {
            layer.commit.hash(&mut hasher);
            layer.playbook.hash(&mut hasher);
        }
        let desired_state_fingerprint = hasher.finish();

        let batch_key = format!("{config_name}:{config_limit}:{latest_status}");

        let desired_state = if retain_desired_state {
            Some(raw.desired_state)
        } else {
            None
        };

        Self {
            id: raw.id,
            error_count: raw.error_count,
            tags: raw.tags,
            config_name,
            desired_state,
            config_limit,
            latest_status,
            latest_timestamp,
            desired_state_fingerprint,
            batch_key,
        }
    }

    fn pending_layer_indices(&self) -> Vec<usize> {
        self.desired_state
            .as_ref()
            .map(|layers| {
                layers
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| l.status.as_deref() == Some(PENDING) || l.status.is_none())
                    .map(|(i, _)| i)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Writes a terminal status back to CFS for the component's pending layers.
    ///
    /// When `all_layers` is true, every pending layer gets an append; otherwise
    /// only the first one does (used by `increment_error_count`, which must not
    /// mark the remaining pending layers as terminal).
    pub async fn set_status<C: Cfs + ?Sized>(
        &self,
        cfs: &C,
        options: &OptionsSnapshot,
        terminal_status: &str,
        session_name: &str,
        error_count: Option<u32>,
        all_layers: bool,
    ) -> Result<(), CfsError> {
        let Some(layers) = &self.desired_state else {
            return Ok(());
        };
        let indices = self.pending_layer_indices();
        let targets: &[usize] = if all_layers {
            &indices
        } else {
            &indices[..indices.len().min(1)]
        };

        for &idx in targets {
            let layer = &layers[idx];
            let clone_url = layer
                .clone_url
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| options.default_clone_url.clone());
            let playbook = layer
                .playbook
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| options.default_playbook.clone());

            let append = StateAppend {
                commit: layer.commit.clone(),
                playbook: Some(playbook),
                clone_url: Some(clone_url),
                status: terminal_status.to_string(),
                session_name: session_name.to_string(),
            };
            let mut patch = ComponentPatch::state(append);
            if let Some(ec) = error_count {
                patch = patch.with_error_count(ec);
            }
            cfs.patch_component(&self.id, &patch).await?;
        }
        Ok(())
    }

    /// Appends a single "failed" marker to the first pending layer and bumps
    /// `errorCount`; does not touch any other pending layer.
    pub async fn increment_error_count<C: Cfs + ?Sized>(
        &self,
        cfs: &C,
        options: &OptionsSnapshot,
        session_name: &str,
    ) -> Result<(), CfsError> {
        self.set_status(
            cfs,
            options,
            "failed",
            session_name,
            Some(self.error_count + 1),
            false,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfs::components::RawLayer;

    fn layer(status: Option<&str>) -> RawLayer {
        RawLayer {
            commit: "abc123".to_string(),
            playbook: Some("site.yml".to_string()),
            clone_url: Some("https://example.com/repo.git".to_string()),
            status: status.map(str::to_string),
        }
    }

    fn raw(id: &str, layers: Vec<RawLayer>) -> RawComponent {
        RawComponent {
            id: id.to_string(),
            enabled: true,
            tags: BTreeMap::new(),
            error_count: 0,
            configuration_status: Some("pending".to_string()),
            desired_config: Some(crate::cfs::components::DesiredConfig {
                name: "cfgA".to_string(),
            }),
            desired_state: layers,
            state: Vec::new(),
        }
    }

    #[test]
    fn single_pending_layer_uses_empty_sentinel() {
        let c = Component::from_raw(raw("n1", vec![layer(Some("pending"))]), true);
        assert_eq!(c.config_limit, "");
        assert_eq!(c.batch_key, "cfgA::");
    }

    #[test]
    fn partial_pending_uses_indices() {
        let layers = vec![layer(Some("complete")), layer(Some("pending"))];
        let c = Component::from_raw(raw("n1", layers), true);
        assert_eq!(c.config_limit, "1");
    }

    #[test]
    fn fingerprint_ignores_status_and_clone_url() {
        let a = Component::from_raw(raw("n1", vec![layer(Some("pending"))]), true);
        let mut other_layer = layer(Some("complete"));
        other_layer.clone_url = Some("https://example.com/other.git".to_string());
        let b = Component::from_raw(raw("n1", vec![other_layer]), true);
        assert_eq!(a.desired_state_fingerprint, b.desired_state_fingerprint);
    }

    #[test]
    fn identity_is_id_only() {
        let a = Component::from_raw(raw("n1", vec![layer(Some("pending"))]), false);
        let b = Component::from_raw(raw("n1", vec![]), false);
        assert_eq!(a, b);
    }
}
