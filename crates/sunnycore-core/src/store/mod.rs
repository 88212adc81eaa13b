//! Record Store (C2) — durable state: items, watches, sync cursors,
//! activity metrics, logs (§4.2).
//!
//! `PgStore` (in `pg`) is the production implementation; `MemStore` (in
//! `mem`) is a `dashmap`-backed fake used by every other component's
//! tests.

pub mod mem;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{
    ActivityMetric, Item, ItemStatus, Project, ProcessingLog, Source, SyncCursor, User, Watch,
};

pub use mem::MemStore;
pub use pg::PgStore;

/// Outcome of the atomic upsert in Pipeline step 1 (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new Item row was created in status `pending`.
    Created,
    /// The row already existed; caller must inspect its status/revision
    /// to decide whether this is a no-op duplicate or an update.
    Existing,
}

/// All multi-row updates a single Pipeline run performs must be atomic
/// per Item (§4.2): no caller of this trait can observe an Item marked
/// `embedded` with its vectors missing, or vice versa. Implementations
/// achieve this with a single transaction per `Ingest` call.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Atomic upsert keyed by `(source, source_id)`. Returns the row
    /// (freshly created or pre-existing) and which case occurred.
    async fn upsert_item_stub(
        &self,
        owner_id: Uuid,
        source: Source,
        source_id: &str,
    ) -> Result<(Item, UpsertOutcome), CoreError>;

    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>, CoreError>;

    async fn get_item_by_source_id(
        &self,
        source: Source,
        source_id: &str,
    ) -> Result<Option<Item>, CoreError>;

    /// Persist a fully-updated Item row (after extraction/classification/
    /// embedding). Replaces the stored row wholesale.
    async fn save_item(&self, item: &Item) -> Result<(), CoreError>;

    /// Soft-delete: marks the row `deleted`. Must only be called after
    /// the caller has already removed the Item's vectors (§3 invariant,
    /// §9 "decoupling delete semantics across stores").
    async fn soft_delete_item(&self, item_id: Uuid) -> Result<(), CoreError>;

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, CoreError>;

    async fn get_user_by_virtual_username(
        &self,
        username: &str,
    ) -> Result<Option<User>, CoreError>;

    async fn list_active_projects_for_user(&self, owner_id: Uuid) -> Result<Vec<Project>, CoreError>;

    async fn get_cursor(&self, owner_id: Uuid, source: Source) -> Result<SyncCursor, CoreError>;

    /// Replaces the cursor atomically; only ever called by the Poller
    /// after a *successful* poll, preserving I3 (monotonicity — a failed
    /// poll must leave the stored cursor untouched, so callers simply
    /// don't call this on failure).
    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<(), CoreError>;

    async fn get_activity_metric(
        &self,
        owner_id: Uuid,
        source: Source,
    ) -> Result<ActivityMetric, CoreError>;

    async fn save_activity_metric(&self, metric: &ActivityMetric) -> Result<(), CoreError>;

    async fn insert_log(&self, log: &ProcessingLog) -> Result<(), CoreError>;

    async fn list_active_watches(&self) -> Result<Vec<Watch>, CoreError>;

    async fn list_watches_expiring_before(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<Watch>, CoreError>;

    async fn save_watch(&self, watch: &Watch) -> Result<(), CoreError>;

    async fn list_all_users(&self) -> Result<Vec<User>, CoreError>;

    /// List items for a user scoped to an optional project, used by
    /// Retrieval's sparse (BM25) pass over enriched text metadata.
    async fn list_items_for_user(
        &self,
        owner_id: Uuid,
        project_id: Option<Uuid>,
    ) -> Result<Vec<Item>, CoreError>;
}

/// Convenience used by `RecordStore::upsert_item_stub` callers: decide
/// whether an existing row means the Pipeline should short-circuit with
/// `Outcome::Duplicate` (§4.7 step 1).
pub fn is_unchanged_duplicate(existing: &Item, incoming_revision: &str) -> bool {
    existing.status == ItemStatus::Embedded && existing.revision == incoming_revision
}
