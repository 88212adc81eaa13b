//! Provider Adapters (C1) — uniform Watch/Poll/Fetch over Mail, Drive,
//! Calendar, per §4.1.
//!
//! Real OAuth/pagination wiring against Gmail/Drive/Calendar is out of
//! scope (§1 excludes identity/session management and the HTTP surface).
//! The trait boundary is the deliverable; `fixture` ships a complete,
//! tested in-memory adapter for self-hosted/test deployments, and
//! `http` is a thin `reqwest`-based skeleton documenting the extension
//! point (see DESIGN.md).

pub mod fixture;
pub mod http;
pub mod mail;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::model::{Source, Watch};

/// The raw payload an adapter returns from `fetch_item`. Kept as a typed
/// struct with a source-specific metadata map at the boundary (§9,
/// "dynamic content dictionaries") — parsing into `model::ItemMetadata`
/// happens in the Pipeline's extraction step, not here.
#[derive(Debug, Clone)]
pub struct RawItem {
    pub source_id: String,
    pub title: String,
    pub author: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub body: String,
    pub revision: String,
    /// Opaque, source-specific fields (headers, attendees, mime-type...).
    /// The Mail adapter additionally stashes the virtual-address
    /// username here under the `"virtual_username"` key when a
    /// `ai+<username>@<domain>` recipient is found (§4.1).
    pub metadata: std::collections::HashMap<String, String>,
}

/// The result of a `poll`: ids that changed plus the provider's new
/// cursor, or `None` if the provider didn't advance it.
#[derive(Debug, Clone)]
pub struct PollResult {
    pub changed_source_ids: Vec<String>,
    /// Source ids the provider reports as deleted since the last poll.
    pub deleted_source_ids: Vec<String>,
    pub new_history_token: Option<String>,
}

/// Adapters hide provider-specific pagination, token refresh, and
/// rate-limit back-off; every call is bounded (attempts ≤ 3, wall-time
/// ≤ 10s, per §4.1) and surfaces `CoreError::Transient` vs
/// `CoreError::Fatal` distinctly rather than retrying internally beyond
/// that fixed budget.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn source(&self) -> Source;

    async fn setup_watch(
        &self,
        owner_id: uuid::Uuid,
        resource_id: Option<&str>,
    ) -> Result<Watch, CoreError>;

    async fn poll(
        &self,
        owner_id: uuid::Uuid,
        history_token: Option<&str>,
    ) -> Result<PollResult, CoreError>;

    async fn fetch_item(
        &self,
        owner_id: uuid::Uuid,
        source_id: &str,
    ) -> Result<RawItem, CoreError>;

    async fn stop_watch(&self, watch: &Watch) -> Result<(), CoreError>;
}

/// Fixed retry budget every adapter call respects (§4.1, §5).
pub const MAX_ADAPTER_ATTEMPTS: u32 = 3;
pub const ADAPTER_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
