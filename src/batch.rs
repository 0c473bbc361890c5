//! A Batch: a set of compatible components sharing one desired configuration and
//! one pending-layer selector, plus its dispatch timer and, once sent, its CFS
//! session name.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::cfs::components::RawComponent;
use crate::cfs::sessions::RawSession;
use crate::cfs::{Cfs, CfsError};
use crate::component::Component;
use crate::OptionsSnapshot;

/// Outcome of polling a Batch's CFS session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    New,
    Pending,
    Complete,
    Failed,
    Deleted,
    Unknown,
}

/// Which terminal outcome reconciliation is handling; only `Complete` and `Failed`
/// ever reach `handle_incomplete_components`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Complete,
    Failed,
}

pub struct Batch {
    /// Members keyed by component id. `pub(crate)` so `BatchManager` can inspect
    /// membership when filing a completed batch's ids out of `activeComponents`.
    pub(crate) members: HashMap<String, Component>,
    config_name: String,
    config_limit: String,
    session_name: Option<String>,
    window_start: Instant,
    batch_start: Instant,
}

impl Batch {
    /// Creates a new Batch with `component` as its sole initial member.
    pub fn new(component: Component) -> Self {
        let now = Instant::now();
        let config_name = component.config_name.clone();
        let config_limit = component.config_limit.clone();
        let mut members = HashMap::new();
        members.insert(component.id.clone(), component);
        Self {
            members,
            config_name,
            config_limit,
            session_name: None,
            window_start: now,
            batch_start: now,
        }
    }

    /// Rebuilds a Batch from a live CFS session found at startup. Returns `None`
    /// if none of the session's referenced components still exist in CFS.
    pub async fn rebuild_from_session<C: Cfs + ?Sized>(
        cfs: &C,
        session: &RawSession,
    ) -> Option<Self> {
        let config = session.configuration.as_ref()?;
        let ansible = session.ansible.as_ref()?;
        let ids = ansible.members();
        let mut members = HashMap::new();
        for id in &ids {
            match cfs.get_component(id).await {
                Ok(Some(raw)) => {
                    members.insert(id.clone(), Component::from_raw(raw, false));
                }
                Ok(None) => {
                    warn!(
                        component_id = %id,
                        session_name = %session.name,
                        "component referenced by in-flight session no longer exists in CFS"
                    );
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        component_id = %id,
                        session_name = %session.name,
                        "failed to fetch component while rebuilding in-flight state"
                    );
                }
            }
        }
        if members.is_empty() {
            return None;
        }
        let now = Instant::now();
        Some(Self {
            members,
            config_name: config.name.clone(),
            config_limit: config.limit.clone(),
            session_name: Some(session.name.clone()),
            window_start: now,
            batch_start: now,
        })
    }

    /// The batch key any one member files this Batch under; the first member's key
    /// is the canonical bucket, since every member shares one once coalesced.
    pub fn filing_key(&self) -> Option<String> {
        self.members.values().next().map(|c| c.batch_key.clone())
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn session_name(&self) -> Option<&str> {
        self.session_name.as_deref()
    }

    /// Attempts to fold `component` into this batch. Idempotent for an existing
    /// member; refuses once a session has already been created or the batch is
    /// already at `batchSize`.
    pub fn try_add(&mut self, component: Component, options: &OptionsSnapshot) -> bool {
        if self.members.contains_key(&component.id) {
            return true;
        }
        if self.session_name.is_none() && self.members.len() < options.batch_size {
            self.members.insert(component.id.clone(), component);
            true
        } else {
            false
        }
    }

    fn is_full(&self, options: &OptionsSnapshot) -> bool {
        self.members.len() >= options.batch_size
    }

    fn is_overdue(&self, options: &OptionsSnapshot) -> bool {
        self.window_start.elapsed() > options.batch_window
    }

    /// Creates the CFS session for this batch once it's full or its window has
    /// elapsed; a no-op if a session already exists or neither condition holds.
    pub async fn try_send<C: Cfs + ?Sized>(&mut self, cfs: &C, options: &OptionsSnapshot) -> bool {
        if self.session_name.is_some() {
            return false;
        }
        if !(self.is_full(options) || self.is_overdue(options)) {
            return false;
        }
        let mut ids: Vec<String> = self.members.keys().cloned().collect();
        ids.sort();
        let tags = self.common_tags();
        match cfs
            .create_session(&self.config_name, &self.config_limit, &ids, Some(tags))
            .await
        {
            Ok(session_name) => {
                info!(
                    session_name = %session_name,
                    config_name = %self.config_name,
                    config_limit = %self.config_limit,
                    members = ids.len(),
                    "created CFS session for batch"
                );
                self.session_name = Some(session_name);
                self.batch_start = Instant::now();
                true
            }
            Err(err) => {
                error!(error = %err, config_name = %self.config_name, "failed to create CFS session for batch");
                false
            }
        }
    }

    /// The intersection of member tag keys where every member agrees on the
    /// value; keys whose values disagree across members are omitted entirely.
    fn common_tags(&self) -> BTreeMap<String, String> {
        let mut members = self.members.values();
        let Some(first) = members.next() else {
            return BTreeMap::new();
        };
        let mut keys: BTreeSet<&String> = first.tags.keys().collect();
        for member in members {
            let member_keys: BTreeSet<&String> = member.tags.keys().collect();
            keys = keys.intersection(&member_keys).copied().collect();
        }
        keys.into_iter()
            .filter_map(|key| {
                let value = &first.tags[key];
                self.members
                    .values()
                    .all(|c| c.tags.get(key) == Some(value))
                    .then(|| (key.clone(), value.clone()))
            })
            .collect()
    }

    /// Polls this batch's CFS session and classifies its current status.
    async fn status<C: Cfs + ?Sized>(&self, cfs: &C) -> Result<SessionStatus, CfsError> {
        let Some(name) = &self.session_name else {
            return Ok(SessionStatus::New);
        };
        match cfs.get_session(name).await? {
            None => Ok(SessionStatus::Deleted),
            Some(session) => {
                let succeeded = session.status.session.succeeded.as_str();
                if succeeded == "false" || succeeded == "unknown" {
                    return Ok(SessionStatus::Failed);
                }
                Ok(match session.status.session.status.to_lowercase().as_str() {
                    "pending" => SessionStatus::Pending,
                    "complete" => SessionStatus::Complete,
                    "failed" => SessionStatus::Failed,
                    _ => SessionStatus::Unknown,
                })
            }
        }
    }

    /// Advances this batch's session lifecycle by one poll, returning
    /// `(complete, success)`. A stuck-pending session past `pendingTimeout` is
    /// deleted and counted as a failure.
    pub async fn check_complete<C: Cfs + ?Sized>(
        &mut self,
        cfs: &C,
        options: &OptionsSnapshot,
    ) -> (bool, bool) {
        match self.status(cfs).await {
            Ok(SessionStatus::Complete) => {
                self.handle_incomplete_components(cfs, options, Outcome::Complete)
                    .await;
                (true, true)
            }
            Ok(SessionStatus::Failed) => {
                self.handle_incomplete_components(cfs, options, Outcome::Failed)
                    .await;
                (true, false)
            }
            Ok(SessionStatus::Deleted) => {
                info!(session_name = ?self.session_name, "session no longer exists");
                (true, false)
            }
            Ok(SessionStatus::Pending) => {
                if self.batch_start.elapsed() > options.pending_timeout {
                    let Some(name) = self.session_name.clone() else {
                        return (false, false);
                    };
                    match cfs.delete_session(&name).await {
                        Ok(()) => {
                            warn!(session_name = %name, "session stuck pending past timeout; deleted");
                            (true, false)
                        }
                        Err(err) => {
                            error!(error = %err, session_name = %name, "failed to delete stuck-pending session");
                            (false, false)
                        }
                    }
                } else {
                    (false, false)
                }
            }
            Ok(SessionStatus::New) | Ok(SessionStatus::Unknown) => (false, false),
            Err(err) => {
                warn!(error = %err, "unexpected error checking session status; retrying next tick");
                (false, false)
            }
        }
    }

    /// Reconciles members whose pending layers the session didn't account for:
    /// writes back `skipped` on an overall success, or `failed` plus a bumped
    /// error count on an overall failure not attributable to Ansible itself.
    async fn handle_incomplete_components<C: Cfs + ?Sized>(
        &self,
        cfs: &C,
        options: &OptionsSnapshot,
        outcome: Outcome,
    ) {
        let Some(session_name) = self.session_name.clone() else {
            return;
        };
        let ids: Vec<String> = self.members.keys().cloned().collect();

        let (incomplete, ansible_failure) = match outcome {
            Outcome::Complete => match cfs.get_components_by_ids(&ids, Some("pending")).await {
                Ok(v) => (v, false),
                Err(err) => {
                    warn!(error = %err, session_name = %session_name, "failed to fetch components for reconciliation");
                    return;
                }
            },
            Outcome::Failed => match cfs.get_components_by_ids(&ids, None).await {
                Ok(all) => {
                    let ansible_failure = self.check_ansible_failure(&all);
                    let pending = all
                        .into_iter()
                        .filter(|c| c.configuration_status.as_deref() == Some("pending"))
                        .collect();
                    (pending, ansible_failure)
                }
                Err(err) => {
                    warn!(error = %err, session_name = %session_name, "failed to fetch components for reconciliation");
                    return;
                }
            },
        };

        for raw in incomplete {
            let Some(starting) = self.members.get(&raw.id) else {
                // Dropped from the batch between dispatch and reconciliation; shouldn't
                // happen since `ids` came from `self.members`, but be defensive.
                continue;
            };
            let current = Component::from_raw(raw, true);
            if starting.desired_state_fingerprint != current.desired_state_fingerprint {
                debug!(component_id = %current.id, "desired configuration changed mid-flight; leaving for next tick");
                continue;
            }
            match outcome {
                Outcome::Complete => {
                    debug!(component_id = %current.id, session_name = %session_name, "writing skipped status for session success with no layer outcome");
                    if let Err(err) = current
                        .set_status(cfs, options, "skipped", &session_name, None, true)
                        .await
                    {
                        error!(error = %err, component_id = %current.id, "failed to write skipped status");
                    }
                }
                Outcome::Failed => {
                    if !ansible_failure {
                        debug!(component_id = %current.id, session_name = %session_name, "incrementing error count for session failure extrinsic to Ansible");
                        if let Err(err) = current
                            .increment_error_count(cfs, options, &session_name)
                            .await
                        {
                            error!(error = %err, component_id = %current.id, "failed to increment error count");
                        }
                    } else {
                        debug!(component_id = %current.id, "Ansible-side failure detected; leaving component for next tick's re-admission");
                    }
                }
            }
        }
    }

    /// Whether at least one member's latest recorded state is `failed` with a
    /// timestamp that advanced since dispatch — the signal that Ansible itself
    /// failed the layer, as opposed to the session failing for some other reason.
    fn check_ansible_failure(&self, current_components: &[RawComponent]) -> bool {
        for raw in current_components {
            let Some(starting) = self.members.get(&raw.id) else {
                continue;
            };
            if let Some(last) = raw.state.last() {
                let last_updated = last.last_updated.clone().unwrap_or_default();
                if last.status == "failed" && last_updated != starting.latest_timestamp {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfs::components::{ComponentPatch, RawLayer};
    use async_trait::async_trait;
    use std::collections::BTreeMap as Map;
    use std::sync::Mutex;

    fn layer(commit: &str, status: Option<&str>) -> RawLayer {
        RawLayer {
            commit: commit.to_string(),
            playbook: Some("site.yml".to_string()),
            clone_url: Some("https://example.com/repo.git".to_string()),
            status: status.map(str::to_string),
        }
    }

    fn raw(id: &str, layers: Vec<RawLayer>, tags: Map<String, String>) -> RawComponent {
        RawComponent {
            id: id.to_string(),
            enabled: true,
            tags,
            error_count: 0,
            configuration_status: Some("pending".to_string()),
            desired_config: Some(crate::cfs::components::DesiredConfig {
                name: "cfgA".to_string(),
            }),
            desired_state: layers,
            state: Vec::new(),
        }
    }

    #[derive(Default)]
    struct FakeCfs {
        patches: Mutex<Vec<(String, ComponentPatch)>>,
    }

    #[async_trait]
    impl Cfs for FakeCfs {
        async fn list_pending_components(&self) -> Result<Vec<RawComponent>, CfsError> {
            Ok(Vec::new())
        }
        async fn get_components_by_ids(
            &self,
            _ids: &[String],
            _status: Option<&str>,
        ) -> Result<Vec<RawComponent>, CfsError> {
            Ok(Vec::new())
        }
        async fn get_component(&self, _id: &str) -> Result<Option<RawComponent>, CfsError> {
            Ok(None)
        }
        async fn patch_component(
            &self,
            id: &str,
            patch: &ComponentPatch,
        ) -> Result<(), CfsError> {
            self.patches
                .lock()
                .unwrap()
                .push((id.to_string(), patch.clone()));
            Ok(())
        }
        async fn list_sessions(&self) -> Result<Vec<RawSession>, CfsError> {
            Ok(Vec::new())
        }
        async fn get_session(&self, _name: &str) -> Result<Option<RawSession>, CfsError> {
            Ok(None)
        }
        async fn create_session(
            &self,
            _configuration_name: &str,
            _configuration_limit: &str,
            _members: &[String],
            _tags: Option<Map<String, String>>,
        ) -> Result<String, CfsError> {
            Ok("batcher-test".to_string())
        }
        async fn delete_session(&self, _name: &str) -> Result<(), CfsError> {
            Ok(())
        }
        async fn get_options(&self) -> Result<Map<String, serde_json::Value>, CfsError> {
            Ok(Map::new())
        }
        async fn patch_options(
            &self,
            _patch: &Map<String, serde_json::Value>,
        ) -> Result<(), CfsError> {
            Ok(())
        }
    }

    #[test]
    fn try_add_refuses_once_full() {
        let mut options = OptionsSnapshot::default();
        options.batch_size = 1;
        let c1 = Component::from_raw(raw("n1", vec![layer("a", Some("pending"))], Map::new()), false);
        let c2 = Component::from_raw(raw("n2", vec![layer("a", Some("pending"))], Map::new()), false);
        let mut batch = Batch::new(c1);
        assert!(!batch.try_add(c2, &options));
    }

    #[test]
    fn try_add_idempotent_for_existing_member() {
        let options = OptionsSnapshot::default();
        let c1 = Component::from_raw(raw("n1", vec![layer("a", Some("pending"))], Map::new()), false);
        let c1_again = Component::from_raw(raw("n1", vec![layer("a", Some("pending"))], Map::new()), false);
        let mut batch = Batch::new(c1);
        assert!(batch.try_add(c1_again, &options));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn common_tags_drops_disagreeing_keys() {
        let mut t1 = Map::new();
        t1.insert("arch".to_string(), "x86".to_string());
        t1.insert("rack".to_string(), "1".to_string());
        let mut t2 = Map::new();
        t2.insert("arch".to_string(), "x86".to_string());
        t2.insert("rack".to_string(), "2".to_string());
        let c1 = Component::from_raw(raw("n1", vec![layer("a", Some("pending"))], t1), false);
        let c2 = Component::from_raw(raw("n2", vec![layer("a", Some("pending"))], t2), false);
        let mut batch = Batch::new(c1);
        let options = OptionsSnapshot::default();
        batch.try_add(c2, &options);
        let tags = batch.common_tags();
        assert_eq!(tags.get("arch"), Some(&"x86".to_string()));
        assert_eq!(tags.get("rack"), None);
    }

    #[tokio::test]
    async fn new_batch_has_no_session_and_reports_new() {
        let cfs = FakeCfs::default();
        let c1 = Component::from_raw(raw("n1", vec![layer("a", Some("pending"))], Map::new()), false);
        let batch = Batch::new(c1);
        assert_eq!(batch.status(&cfs).await.unwrap(), SessionStatus::New);
    }
}
