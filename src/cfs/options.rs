use super::{Cfs, CfsError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// An owned, immutable view of CFS's options document as of the last successful
/// refresh. Passed by value into the operations that need it rather than consulted
/// through a process-wide singleton.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionsSnapshot {
    pub check_interval: Duration,
    pub batch_size: usize,
    pub batch_window: Duration,
    pub retry_policy: u32,
    pub max_backoff: Duration,
    pub disable: bool,
    pub pending_timeout: Duration,
    pub logging_level: String,
    pub default_clone_url: String,
    pub default_playbook: String,
}

impl Default for OptionsSnapshot {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            batch_size: 25,
            batch_window: Duration::from_secs(60),
            retry_policy: 3,
            max_backoff: Duration::from_secs(3600),
            disable: false,
            pending_timeout: Duration::from_secs(300),
            logging_level: "INFO".to_string(),
            default_clone_url: String::new(),
            default_playbook: "site.yml".to_string(),
        }
    }
}

/// Caches the last options document CFS handed back and fills in built-in defaults
/// for anything missing, patching those defaults back so CFS learns them on first
/// run.
pub struct OptionsCache {
    current: OptionsSnapshot,
}

impl OptionsCache {
    pub fn new() -> Self {
        Self {
            current: OptionsSnapshot::default(),
        }
    }

    /// Fetches options from CFS, coercing/filling defaults for anything absent and
    /// patching those defaults back. On transport failure the previous snapshot is
    /// kept untouched and the error is surfaced to the caller, who should log it and
    /// carry on with the stale snapshot.
    pub async fn refresh<C: Cfs + ?Sized>(&mut self, cfs: &C) -> Result<(), CfsError> {
        let doc = cfs.get_options().await?;
        let defaults = OptionsSnapshot::default();
        let mut missing: BTreeMap<String, Value> = BTreeMap::new();

        let check_interval = secs_or_default(
            &doc,
            "batcherCheckInterval",
            defaults.check_interval,
            &mut missing,
        );
        let batch_size = usize_or_default(&doc, "batchSize", defaults.batch_size, &mut missing);
        let batch_window =
            secs_or_default(&doc, "batchWindow", defaults.batch_window, &mut missing);
        let retry_policy = u32_or_default(
            &doc,
            "defaultBatcherRetryPolicy",
            defaults.retry_policy,
            &mut missing,
        );
        let max_backoff = secs_or_default(
            &doc,
            "batcherMaxBackoff",
            defaults.max_backoff,
            &mut missing,
        );
        let disable = bool_or_default(&doc, "batcherDisable", defaults.disable, &mut missing);
        let pending_timeout = secs_or_default(
            &doc,
            "batcherPendingTimeout",
            defaults.pending_timeout,
            &mut missing,
        );
        let logging_level = string_or_default(
            &doc,
            "loggingLevel",
            &defaults.logging_level,
            &mut missing,
        );
        let default_clone_url = string_or_default(
            &doc,
            "defaultCloneUrl",
            &defaults.default_clone_url,
            &mut missing,
        );
        let default_playbook = string_or_default(
            &doc,
            "defaultPlaybook",
            &defaults.default_playbook,
            &mut missing,
        );

        if !missing.is_empty() {
            if let Err(err) = cfs.patch_options(&missing).await {
                warn!(error = %err, "failed to patch missing option defaults back to CFS");
            }
        }

        self.current = OptionsSnapshot {
            check_interval,
            batch_size,
            batch_window,
            retry_policy,
            max_backoff,
            disable,
            pending_timeout,
            logging_level,
            default_clone_url,
            default_playbook,
        };
        Ok(())
    }

    /// Owned copy of the last successful snapshot.
    pub fn snapshot(&self) -> OptionsSnapshot {
        self.current.clone()
    }
}

impl Default for OptionsCache {
    fn default() -> Self {
        Self::new()
    }
}

fn secs_or_default(
    doc: &BTreeMap<String, Value>,
    key: &str,
    default: Duration,
    missing: &mut BTreeMap<String, Value>,
) -> Duration {
    match doc.get(key).and_then(Value::as_u64) {
        Some(v) => Duration::from_secs(v),
        None => {
            missing.insert(key.to_string(), Value::from(default.as_secs()));
            default
        }
    }
}

fn usize_or_default(
    doc: &BTreeMap<String, Value>,
    key: &str,
    default: usize,
    missing: &mut BTreeMap<String, Value>,
) -> usize {
    match doc.get(key).and_then(Value::as_u64) {
        Some(v) => v as usize,
        None => {
            missing.insert(key.to_string(), Value::from(default as u64));
            default
        }
    }
}

fn u32_or_default(
    doc: &BTreeMap<String, Value>,
    key: &str,
    default: u32,
    missing: &mut BTreeMap<String, Value>,
) -> u32 {
    match doc.get(key).and_then(Value::as_u64) {
        Some(v) => v as u32,
        None => {
            missing.insert(key.to_string(), Value::from(default));
            default
        }
    }
}

fn bool_or_default(
    doc: &BTreeMap<String, Value>,
    key: &str,
    default: bool,
    missing: &mut BTreeMap<String, Value>,
) -> bool {
    match doc.get(key).and_then(Value::as_bool) {
        Some(v) => v,
        None => {
            missing.insert(key.to_string(), Value::from(default));
            default
        }
    }
}

fn string_or_default(
    doc: &BTreeMap<String, Value>,
    key: &str,
    default: &str,
    missing: &mut BTreeMap<String, Value>,
) -> String {
    match doc.get(key).and_then(Value::as_str) {
        Some(v) => v.to_string(),
        None => {
            missing.insert(key.to_string(), Value::from(default));
            default.to_string()
        }
    }
}
