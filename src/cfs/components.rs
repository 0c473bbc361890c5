use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One desired-state layer as CFS returns it: a commit/playbook/clone-url triple plus
/// the status CFS last recorded for it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RawLayer {
    pub commit: String,
    #[serde(default)]
    pub playbook: Option<String>,
    #[serde(rename = "cloneUrl", default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// One entry in a component's `state` history, appended to whenever a layer's
/// configuration session reaches a terminal outcome.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RawStateEntry {
    pub commit: String,
    pub status: String,
    #[serde(rename = "lastUpdated", default)]
    pub last_updated: Option<String>,
    #[serde(rename = "sessionName", default)]
    pub session_name: Option<String>,
}

/// `desiredConfig` on a component: names which config layer, if any, governs it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DesiredConfig {
    pub name: String,
}

/// A component as CFS serves it over `GET /components`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RawComponent {
    pub id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(rename = "errorCount", default)]
    pub error_count: u32,
    /// Top-level status CFS uses for the `?status=` query filter (e.g. `"pending"`).
    /// Distinct from any individual layer's status in `desiredState`.
    #[serde(rename = "configurationStatus", default)]
    pub configuration_status: Option<String>,
    #[serde(rename = "desiredConfig", default)]
    pub desired_config: Option<DesiredConfig>,
    #[serde(rename = "desiredState", default)]
    pub desired_state: Vec<RawLayer>,
    #[serde(default)]
    pub state: Vec<RawStateEntry>,
}

/// `GET /components` is paginated: `{ components: [...], next }`.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentPage {
    #[serde(default)]
    pub components: Vec<RawComponent>,
    #[serde(default)]
    pub next: Option<String>,
}

/// Body of the append CFS performs on a component's `state` array.
#[derive(Debug, Clone, Serialize)]
pub struct StateAppend {
    pub commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playbook: Option<String>,
    #[serde(rename = "cloneUrl", skip_serializing_if = "Option::is_none")]
    pub clone_url: Option<String>,
    pub status: String,
    #[serde(rename = "sessionName")]
    pub session_name: String,
}

/// `PATCH /components/{id}` body: CFS appends `stateAppend` to `state` and, when
/// present, overwrites `errorCount` in the same call.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ComponentPatch {
    #[serde(rename = "stateAppend", skip_serializing_if = "Option::is_none")]
    pub state_append: Option<StateAppend>,
    #[serde(rename = "errorCount", skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u32>,
}

impl ComponentPatch {
    pub fn state(append: StateAppend) -> Self {
        Self {
            state_append: Some(append),
            error_count: None,
        }
    }

    pub fn with_error_count(mut self, count: u32) -> Self {
        self.error_count = Some(count);
        self
    }
}
