//! Everything the batching engine needs from the external Configuration Framework
//! Service: request/response shapes, a trait abstracting the HTTP surface (so the
//! engine can be driven against a fake in tests), and the real `reqwest`-backed
//! implementation.

pub mod client;
pub mod components;
pub mod error;
pub mod options;
pub mod sessions;

pub use client::CfsClient;
pub use error::CfsError;

use async_trait::async_trait;
use std::collections::BTreeMap;

pub use components::{ComponentPatch, RawComponent, RawLayer, RawStateEntry, StateAppend};
pub use sessions::{CreateSessionRequest, RawSession};

/// Everything the engine depends on from CFS, abstracted behind a trait so unit and
/// scenario tests (see `tests/`) can drive the engine against an in-process fake
/// rather than a real HTTP listener.
#[async_trait]
pub trait Cfs: Send + Sync {
    /// `GET /components?enabled=true&status=pending`, fully paginated.
    async fn list_pending_components(&self) -> Result<Vec<RawComponent>, CfsError>;

    /// `GET /components?ids=...[&status=...]`, fully paginated.
    async fn get_components_by_ids(
        &self,
        ids: &[String],
        status: Option<&str>,
    ) -> Result<Vec<RawComponent>, CfsError>;

    /// `GET /components/{id}`. `Ok(None)` means the component no longer exists.
    async fn get_component(&self, id: &str) -> Result<Option<RawComponent>, CfsError>;

    /// `PATCH /components/{id}`.
    async fn patch_component(&self, id: &str, patch: &ComponentPatch) -> Result<(), CfsError>;

    /// `GET /sessions`, fully paginated.
    async fn list_sessions(&self) -> Result<Vec<RawSession>, CfsError>;

    /// `GET /sessions/{name}`. `Ok(None)` means the session no longer exists (404).
    async fn get_session(&self, name: &str) -> Result<Option<RawSession>, CfsError>;

    /// `POST /sessions`. Generates the session name (`"batcher-" + uuidv4`) and
    /// returns it on success.
    async fn create_session(
        &self,
        configuration_name: &str,
        configuration_limit: &str,
        members: &[String],
        tags: Option<BTreeMap<String, String>>,
    ) -> Result<String, CfsError>;

    /// `DELETE /sessions/{name}`.
    async fn delete_session(&self, name: &str) -> Result<(), CfsError>;

    /// `GET /options`.
    async fn get_options(&self) -> Result<BTreeMap<String, serde_json::Value>, CfsError>;

    /// `PATCH /options`.
    async fn patch_options(
        &self,
        patch: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), CfsError>;
}
