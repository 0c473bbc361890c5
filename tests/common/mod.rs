//! An in-process, hand-rolled `Cfs` fake shared by the scenario tests in this
//! directory. Backed by `Mutex`-guarded maps rather than a real HTTP listener —
//! `wiremock`/`httpmock` appear nowhere in the retrieved example pack, and the
//! teacher repo's own tests (`aa-rs/src/paymaster.rs`) build their fixtures
//! in-process with plain `json!` values rather than standing up a server too.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use cfs_batcher::cfs::components::DesiredConfig;
use cfs_batcher::cfs::sessions::{SessionAnsible, SessionConfiguration, SessionPhase, SessionStatusRaw};
use cfs_batcher::cfs::{ComponentPatch, RawComponent, RawLayer, RawSession, RawStateEntry};
use cfs_batcher::{Cfs, CfsError};

#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub name: String,
    pub configuration_name: String,
    pub configuration_limit: String,
    pub members: Vec<String>,
}

#[derive(Default)]
pub struct FakeCfs {
    components: Mutex<BTreeMap<String, RawComponent>>,
    sessions: Mutex<BTreeMap<String, RawSession>>,
    created: Mutex<Vec<CreatedSession>>,
    deleted: Mutex<Vec<String>>,
    patches: Mutex<Vec<(String, ComponentPatch)>>,
    options: Mutex<BTreeMap<String, Value>>,
    next_session_id: Mutex<u32>,
}

impl FakeCfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_component(&self, component: RawComponent) {
        self.components
            .lock()
            .unwrap()
            .insert(component.id.clone(), component);
    }

    pub fn remove_component(&self, id: &str) {
        self.components.lock().unwrap().remove(id);
    }

    pub fn put_session(&self, session: RawSession) {
        self.sessions.lock().unwrap().insert(session.name.clone(), session);
    }

    /// Overwrites a tracked session's status block, as if CFS's own Ansible
    /// execution had advanced it.
    pub fn set_session_status(&self, name: &str, status: &str, succeeded: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(name) {
            session.status = SessionStatusRaw {
                session: SessionPhase {
                    status: status.to_string(),
                    succeeded: succeeded.to_string(),
                },
            };
        }
    }

    pub fn created_sessions(&self) -> Vec<CreatedSession> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted_sessions(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn patches(&self) -> Vec<(String, ComponentPatch)> {
        self.patches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Cfs for FakeCfs {
    async fn list_pending_components(&self) -> Result<Vec<RawComponent>, CfsError> {
        Ok(self
            .components
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.enabled && c.configuration_status.as_deref() == Some("pending"))
            .cloned()
            .collect())
    }

    async fn get_components_by_ids(
        &self,
        ids: &[String],
        status: Option<&str>,
    ) -> Result<Vec<RawComponent>, CfsError> {
        let components = self.components.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| components.get(id))
            .filter(|c| status.map(|s| c.configuration_status.as_deref() == Some(s)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_component(&self, id: &str) -> Result<Option<RawComponent>, CfsError> {
        Ok(self.components.lock().unwrap().get(id).cloned())
    }

    async fn patch_component(&self, id: &str, patch: &ComponentPatch) -> Result<(), CfsError> {
        self.patches.lock().unwrap().push((id.to_string(), patch.clone()));
        let mut components = self.components.lock().unwrap();
        if let Some(component) = components.get_mut(id) {
            if let Some(append) = &patch.state_append {
                component.state.push(RawStateEntry {
                    commit: append.commit.clone(),
                    status: append.status.clone(),
                    last_updated: Some(format!("applied-by-{}", append.session_name)),
                    session_name: Some(append.session_name.clone()),
                });
            }
            if let Some(count) = patch.error_count {
                component.error_count = count;
            }
        }
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<RawSession>, CfsError> {
        Ok(self.sessions.lock().unwrap().values().cloned().collect())
    }

    async fn get_session(&self, name: &str) -> Result<Option<RawSession>, CfsError> {
        Ok(self.sessions.lock().unwrap().get(name).cloned())
    }

    async fn create_session(
        &self,
        configuration_name: &str,
        configuration_limit: &str,
        members: &[String],
        tags: Option<BTreeMap<String, String>>,
    ) -> Result<String, CfsError> {
        let mut counter = self.next_session_id.lock().unwrap();
        let name = format!("batcher-test-{counter}");
        *counter += 1;
        drop(counter);

        let mut member_ids = members.to_vec();
        member_ids.sort();
        let session = RawSession {
            name: name.clone(),
            configuration: Some(SessionConfiguration {
                name: configuration_name.to_string(),
                limit: configuration_limit.to_string(),
            }),
            ansible: Some(SessionAnsible {
                limit: member_ids.join(","),
            }),
            status: SessionStatusRaw {
                session: SessionPhase {
                    status: "pending".to_string(),
                    succeeded: String::new(),
                },
            },
        };
        self.sessions.lock().unwrap().insert(name.clone(), session);
        self.created.lock().unwrap().push(CreatedSession {
            name: name.clone(),
            configuration_name: configuration_name.to_string(),
            configuration_limit: configuration_limit.to_string(),
            members: member_ids,
        });
        let _ = tags;
        Ok(name)
    }

    async fn delete_session(&self, name: &str) -> Result<(), CfsError> {
        self.sessions.lock().unwrap().remove(name);
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn get_options(&self) -> Result<BTreeMap<String, Value>, CfsError> {
        Ok(self.options.lock().unwrap().clone())
    }

    async fn patch_options(&self, patch: &BTreeMap<String, Value>) -> Result<(), CfsError> {
        self.options.lock().unwrap().extend(patch.clone());
        Ok(())
    }
}

pub fn pending_layer(commit: &str) -> RawLayer {
    RawLayer {
        commit: commit.to_string(),
        playbook: Some("site.yml".to_string()),
        clone_url: Some("https://vcs.example.com/configs.git".to_string()),
        status: Some("pending".to_string()),
    }
}

pub fn component(id: &str, config_name: &str, layers: Vec<RawLayer>) -> RawComponent {
    RawComponent {
        id: id.to_string(),
        enabled: true,
        tags: BTreeMap::new(),
        error_count: 0,
        configuration_status: Some("pending".to_string()),
        desired_config: Some(DesiredConfig {
            name: config_name.to_string(),
        }),
        desired_state: layers,
        state: Vec::new(),
    }
}
