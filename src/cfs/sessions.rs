use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A CFS session as returned by `GET /sessions` / `GET /sessions/{name}`. The read
/// shape nests the configuration/ansible data that the POST body sends flat: startup
/// rebuild reads `configuration.name`, `configuration.limit`, and `ansible.limit`
/// back out of this nested form.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RawSession {
    pub name: String,
    #[serde(default)]
    pub configuration: Option<SessionConfiguration>,
    #[serde(default)]
    pub ansible: Option<SessionAnsible>,
    #[serde(default)]
    pub status: SessionStatusRaw,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SessionConfiguration {
    pub name: String,
    #[serde(default)]
    pub limit: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SessionAnsible {
    #[serde(default)]
    pub limit: String,
}

impl SessionAnsible {
    /// Member component ids, parsed back out of the comma-separated `limit` this
    /// agent writes on creation (see `CreateSessionRequest::ansible_limit`).
    pub fn members(&self) -> Vec<String> {
        self.limit
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// The subset of a session's status block the engine inspects.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct SessionStatusRaw {
    #[serde(default)]
    pub session: SessionPhase,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct SessionPhase {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub succeeded: String,
}

/// `GET /sessions` is paginated: `{ sessions: [...], next }`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionPage {
    #[serde(default)]
    pub sessions: Vec<RawSession>,
    #[serde(default)]
    pub next: Option<String>,
}

/// `POST /sessions` body.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    pub name: String,
    #[serde(rename = "configurationName")]
    pub configuration_name: String,
    #[serde(rename = "configurationLimit")]
    pub configuration_limit: String,
    #[serde(rename = "ansibleLimit")]
    pub ansible_limit: String,
    pub target: SessionTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionTarget {
    pub definition: String,
}

impl SessionTarget {
    pub fn dynamic() -> Self {
        Self {
            definition: "dynamic".to_string(),
        }
    }
}
