use super::components::{ComponentPage, ComponentPatch, RawComponent};
use super::error::CfsError;
use super::sessions::{CreateSessionRequest, RawSession, SessionPage, SessionTarget};
use super::Cfs;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

const RETRY_ATTEMPTS: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(200);
const SESSION_PAGE_LIMIT: u32 = 100;
const COMPONENT_PAGE_LIMIT: u32 = 100;

/// `reqwest`-backed implementation of [`Cfs`] talking to a real CFS instance.
///
/// Transport-level failures (connection refused, timeout, DNS) are retried a few
/// times with doubling delay.
/// Non-2xx responses (other than a 404 on a single-resource GET, which callers
/// treat as "gone") are surfaced immediately as [`CfsError::Decode`] — CFS itself
/// is expected to be reliable once reachable, so repeated 5xx isn't masked by
/// blind retrying.
pub struct CfsClient {
    base_url: String,
    http: reqwest::Client,
    dry_run: bool,
}

impl CfsClient {
    pub fn new(base_url: impl Into<String>, dry_run: bool) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            dry_run,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json(&self, url: &str) -> Result<Option<Value>, CfsError> {
        let mut delay = INITIAL_RETRY_DELAY;
        for attempt in 1..=RETRY_ATTEMPTS {
            match self.http.get(url).send().await {
                Ok(resp) => {
                    if resp.status() == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if !resp.status().is_success() {
                        return Err(CfsError::Decode(format!(
                            "GET {url} returned {}",
                            resp.status()
                        )));
                    }
                    let body = resp
                        .json::<Value>()
                        .await
                        .map_err(|e| CfsError::Decode(e.to_string()))?;
                    return Ok(Some(body));
                }
                Err(err) => {
                    if attempt == RETRY_ATTEMPTS || !err.is_connect() && !err.is_timeout() {
                        return Err(err.into());
                    }
                    tracing::warn!(
                        attempt,
                        url,
                        sleep_ms = delay.as_millis() as u64,
                        error = %err,
                        "GET to CFS failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<(), CfsError> {
        if self.dry_run {
            tracing::info!(%method, url, "dry-run: skipping mutating CFS call");
            return Ok(());
        }

        let mut delay = INITIAL_RETRY_DELAY;
        for attempt in 1..=RETRY_ATTEMPTS {
            let mut req = self.http.request(method.clone(), url);
            if let Some(b) = body {
                req = req.json(b);
            }
            match req.send().await {
                Ok(resp) => {
                    if resp.status() == StatusCode::NOT_FOUND {
                        return Err(CfsError::NotFound);
                    }
                    if !resp.status().is_success() {
                        return Err(CfsError::Decode(format!(
                            "{method} {url} returned {}",
                            resp.status()
                        )));
                    }
                    return Ok(());
                }
                Err(err) => {
                    if attempt == RETRY_ATTEMPTS || !err.is_connect() && !err.is_timeout() {
                        return Err(err.into());
                    }
                    tracing::warn!(
                        attempt,
                        %method,
                        url,
                        sleep_ms = delay.as_millis() as u64,
                        error = %err,
                        "call to CFS failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn paginate_components(&self, first_url: String) -> Result<Vec<RawComponent>, CfsError> {
        let mut all = Vec::new();
        let mut url = first_url;
        loop {
            let body = self.get_json(&url).await?.unwrap_or(Value::Null);
            let page: ComponentPage =
                serde_json::from_value(body).map_err(|e| CfsError::Decode(e.to_string()))?;
            all.extend(page.components);
            match page.next {
                Some(next) if !next.is_empty() => url = self.url(&next),
                _ => break,
            }
        }
        Ok(all)
    }
}

#[async_trait]
impl Cfs for CfsClient {
    async fn list_pending_components(&self) -> Result<Vec<RawComponent>, CfsError> {
        let url = self.url(&format!(
            "components?enabled=true&status=pending&configDetails=true&stateDetails=true&limit={COMPONENT_PAGE_LIMIT}"
        ));
        self.paginate_components(url).await
    }

    async fn get_components_by_ids(
        &self,
        ids: &[String],
        status: Option<&str>,
    ) -> Result<Vec<RawComponent>, CfsError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut url = self.url(&format!(
            "components?ids={}&configDetails=true&stateDetails=true&limit={COMPONENT_PAGE_LIMIT}",
            ids.join(",")
        ));
        if let Some(s) = status {
            url.push_str(&format!("&status={s}"));
        }
        self.paginate_components(url).await
    }

    async fn get_component(&self, id: &str) -> Result<Option<RawComponent>, CfsError> {
        let url = self.url(&format!("components/{id}?configDetails=true&stateDetails=true"));
        match self.get_json(&url).await? {
            None => Ok(None),
            Some(body) => {
                let component: RawComponent =
                    serde_json::from_value(body).map_err(|e| CfsError::Decode(e.to_string()))?;
                Ok(Some(component))
            }
        }
    }

    async fn patch_component(&self, id: &str, patch: &ComponentPatch) -> Result<(), CfsError> {
        let url = self.url(&format!("components/{id}"));
        let body = serde_json::to_value(patch).map_err(|e| CfsError::Decode(e.to_string()))?;
        self.send_json(reqwest::Method::PATCH, &url, Some(&body))
            .await
    }

    async fn list_sessions(&self) -> Result<Vec<RawSession>, CfsError> {
        let mut all = Vec::new();
        let mut url = self.url(&format!("sessions?limit={SESSION_PAGE_LIMIT}"));
        loop {
            let body = self.get_json(&url).await?.unwrap_or(Value::Null);
            let page: SessionPage =
                serde_json::from_value(body).map_err(|e| CfsError::Decode(e.to_string()))?;
            all.extend(page.sessions);
            match page.next {
                Some(next) if !next.is_empty() => url = self.url(&next),
                _ => break,
            }
        }
        Ok(all)
    }

    async fn get_session(&self, name: &str) -> Result<Option<RawSession>, CfsError> {
        let url = self.url(&format!("sessions/{name}"));
        match self.get_json(&url).await? {
            None => Ok(None),
            Some(body) => {
                let session: RawSession =
                    serde_json::from_value(body).map_err(|e| CfsError::Decode(e.to_string()))?;
                Ok(Some(session))
            }
        }
    }

    async fn create_session(
        &self,
        configuration_name: &str,
        configuration_limit: &str,
        members: &[String],
        tags: Option<BTreeMap<String, String>>,
    ) -> Result<String, CfsError> {
        let name = format!("batcher-{}", Uuid::new_v4());
        let req = CreateSessionRequest {
            name: name.clone(),
            configuration_name: configuration_name.to_string(),
            configuration_limit: configuration_limit.to_string(),
            ansible_limit: members.join(","),
            target: SessionTarget::dynamic(),
            tags,
        };
        let url = self.url("sessions");
        let body = serde_json::to_value(&req).map_err(|e| CfsError::Decode(e.to_string()))?;
        self.send_json(reqwest::Method::POST, &url, Some(&body))
            .await?;
        Ok(name)
    }

    async fn delete_session(&self, name: &str) -> Result<(), CfsError> {
        let url = self.url(&format!("sessions/{name}"));
        self.send_json(reqwest::Method::DELETE, &url, None).await
    }

    async fn get_options(&self) -> Result<BTreeMap<String, Value>, CfsError> {
        let url = self.url("options");
        let body = self.get_json(&url).await?.unwrap_or(Value::Null);
        let options: BTreeMap<String, Value> =
            serde_json::from_value(body).unwrap_or_default();
        Ok(options)
    }

    async fn patch_options(&self, patch: &BTreeMap<String, Value>) -> Result<(), CfsError> {
        let url = self.url("options");
        let body = serde_json::to_value(patch).map_err(|e| CfsError::Decode(e.to_string()))?;
        self.send_json(reqwest::Method::PATCH, &url, Some(&body))
            .await
    }
}
