//! In-memory `RecordStore`, keyed the same way the Postgres schema
//! would be. Used by every other component's tests; exclusion (§5) is
//! provided by a `dashmap`-backed per-key lease.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{
    ActivityMetric, Item, ItemMetadata, ItemStatus, Project, ProcessingLog, Source, SyncCursor,
    User, Watch,
};

use super::{RecordStore, UpsertOutcome};

#[derive(Default)]
pub struct MemStore {
    items_by_id: DashMap<Uuid, Item>,
    items_by_source: DashMap<(Source, String), Uuid>,
    users: DashMap<Uuid, User>,
    users_by_username: DashMap<String, Uuid>,
    projects: DashMap<Uuid, Project>,
    cursors: DashMap<(Uuid, &'static str), SyncCursor>,
    metrics: DashMap<(Uuid, &'static str), ActivityMetric>,
    logs: Mutex<Vec<ProcessingLog>>,
    watches: DashMap<Uuid, Watch>,
    /// Per-(source, source_id) exclusion lease (§5 option (c)): held for
    /// the duration of `upsert_item_stub` so concurrent `Ingest` calls
    /// for the same key serialize.
    locks: DashMap<(Source, String), Arc<tokio::sync::Mutex<()>>>,
}

fn source_key(source: Source) -> &'static str {
    source.as_str()
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: User) {
        self.users_by_username
            .insert(user.username.clone(), user.id);
        self.users.insert(user.id, user);
    }

    pub fn insert_project(&self, project: Project) {
        self.projects.insert(project.id, project);
    }

    pub fn logs(&self) -> Vec<ProcessingLog> {
        self.logs.lock().clone()
    }

    fn lease_for(&self, source: Source, source_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry((source, source_id.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl RecordStore for MemStore {
    async fn upsert_item_stub(
        &self,
        owner_id: Uuid,
        source: Source,
        source_id: &str,
    ) -> Result<(Item, UpsertOutcome), CoreError> {
        let lease = self.lease_for(source, source_id);
        let _guard = lease.lock().await;

        if let Some(existing_id) = self.items_by_source.get(&(source, source_id.to_string())) {
            let item = self
                .items_by_id
                .get(&*existing_id)
                .map(|r| r.clone())
                .ok_or_else(|| CoreError::invariant("dangling source-id index"))?;
            return Ok((item, UpsertOutcome::Existing));
        }

        let item = Item {
            id: Uuid::new_v4(),
            source,
            source_id: source_id.to_string(),
            owner_id,
            project_id: None,
            title: String::new(),
            author: String::new(),
            received_at: Utc::now(),
            body: String::new(),
            metadata: placeholder_metadata(source),
            status: ItemStatus::Pending,
            revision: String::new(),
        };
        self.items_by_id.insert(item.id, item.clone());
        self.items_by_source
            .insert((source, source_id.to_string()), item.id);
        Ok((item, UpsertOutcome::Created))
    }

    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>, CoreError> {
        Ok(self.items_by_id.get(&item_id).map(|r| r.clone()))
    }

    async fn get_item_by_source_id(
        &self,
        source: Source,
        source_id: &str,
    ) -> Result<Option<Item>, CoreError> {
        let Some(id) = self.items_by_source.get(&(source, source_id.to_string())) else {
            return Ok(None);
        };
        Ok(self.items_by_id.get(&*id).map(|r| r.clone()))
    }

    async fn save_item(&self, item: &Item) -> Result<(), CoreError> {
        self.items_by_source
            .insert((item.source, item.source_id.clone()), item.id);
        self.items_by_id.insert(item.id, item.clone());
        Ok(())
    }

    async fn soft_delete_item(&self, item_id: Uuid) -> Result<(), CoreError> {
        if let Some(mut item) = self.items_by_id.get_mut(&item_id) {
            item.status = ItemStatus::Deleted;
            Ok(())
        } else {
            Err(CoreError::fatal("item not found"))
        }
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, CoreError> {
        Ok(self.users.get(&user_id).map(|r| r.clone()))
    }

    async fn get_user_by_virtual_username(
        &self,
        username: &str,
    ) -> Result<Option<User>, CoreError> {
        let Some(id) = self.users_by_username.get(username) else {
            return Ok(None);
        };
        Ok(self.users.get(&*id).map(|r| r.clone()))
    }

    async fn list_active_projects_for_user(
        &self,
        owner_id: Uuid,
    ) -> Result<Vec<Project>, CoreError> {
        Ok(self
            .projects
            .iter()
            .filter(|p| p.owner_id == owner_id && p.status == crate::model::ProjectStatus::Active)
            .map(|p| p.clone())
            .collect())
    }

    async fn get_cursor(&self, owner_id: Uuid, source: Source) -> Result<SyncCursor, CoreError> {
        Ok(self
            .cursors
            .get(&(owner_id, source_key(source)))
            .map(|r| r.clone())
            .unwrap_or(SyncCursor {
                owner_id,
                source,
                history_token: None,
                last_successful_poll: None,
            }))
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<(), CoreError> {
        self.cursors.insert(
            (cursor.owner_id, source_key(cursor.source)),
            cursor.clone(),
        );
        Ok(())
    }

    async fn get_activity_metric(
        &self,
        owner_id: Uuid,
        source: Source,
    ) -> Result<ActivityMetric, CoreError> {
        Ok(self
            .metrics
            .get(&(owner_id, source_key(source)))
            .map(|r| r.clone())
            .unwrap_or_else(|| ActivityMetric::new(owner_id, source)))
    }

    async fn save_activity_metric(&self, metric: &ActivityMetric) -> Result<(), CoreError> {
        self.metrics.insert(
            (metric.owner_id, source_key(metric.source)),
            metric.clone(),
        );
        Ok(())
    }

    async fn insert_log(&self, log: &ProcessingLog) -> Result<(), CoreError> {
        self.logs.lock().push(log.clone());
        Ok(())
    }

    async fn list_active_watches(&self) -> Result<Vec<Watch>, CoreError> {
        Ok(self
            .watches
            .iter()
            .filter(|w| w.active)
            .map(|w| w.clone())
            .collect())
    }

    async fn list_watches_expiring_before(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<Watch>, CoreError> {
        Ok(self
            .watches
            .iter()
            .filter(|w| w.active && w.expiry <= deadline)
            .map(|w| w.clone())
            .collect())
    }

    async fn save_watch(&self, watch: &Watch) -> Result<(), CoreError> {
        self.watches.insert(watch.id, watch.clone());
        Ok(())
    }

    async fn list_all_users(&self) -> Result<Vec<User>, CoreError> {
        Ok(self.users.iter().map(|u| u.clone()).collect())
    }

    async fn list_items_for_user(
        &self,
        owner_id: Uuid,
        project_id: Option<Uuid>,
    ) -> Result<Vec<Item>, CoreError> {
        Ok(self
            .items_by_id
            .iter()
            .filter(|i| {
                i.owner_id == owner_id
                    && i.status == ItemStatus::Embedded
                    && project_id.is_none_or(|p| i.project_id == Some(p))
            })
            .map(|i| i.clone())
            .collect())
    }
}

fn placeholder_metadata(source: Source) -> ItemMetadata {
    match source {
        Source::Mail => ItemMetadata::Mail {
            headers: Default::default(),
            attachments: Vec::new(),
        },
        Source::Drive => ItemMetadata::Drive {
            mime_type: String::new(),
            size_bytes: 0,
            revision: String::new(),
        },
        Source::Calendar => ItemMetadata::Calendar {
            attendees: Vec::new(),
            start: Utc::now(),
            end: Utc::now(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_is_idempotent_per_source_id() {
        let store = MemStore::new();
        let owner = Uuid::new_v4();

        let (item1, outcome1) = store
            .upsert_item_stub(owner, Source::Mail, "msg-1")
            .await
            .unwrap();
        assert_eq!(outcome1, UpsertOutcome::Created);

        let (item2, outcome2) = store
            .upsert_item_stub(owner, Source::Mail, "msg-1")
            .await
            .unwrap();
        assert_eq!(outcome2, UpsertOutcome::Existing);
        assert_eq!(item1.id, item2.id);
    }

    #[tokio::test]
    async fn different_sources_with_same_source_id_are_distinct() {
        let store = MemStore::new();
        let owner = Uuid::new_v4();

        let (mail_item, _) = store
            .upsert_item_stub(owner, Source::Mail, "id-1")
            .await
            .unwrap();
        let (drive_item, _) = store
            .upsert_item_stub(owner, Source::Drive, "id-1")
            .await
            .unwrap();
        assert_ne!(mail_item.id, drive_item.id);
    }

    #[tokio::test]
    async fn cursor_round_trips() {
        let store = MemStore::new();
        let owner = Uuid::new_v4();
        let cursor = SyncCursor {
            owner_id: owner,
            source: Source::Drive,
            history_token: Some("tok-1".to_string()),
            last_successful_poll: Some(Utc::now()),
        };
        store.save_cursor(&cursor).await.unwrap();
        let read_back = store.get_cursor(owner, Source::Drive).await.unwrap();
        assert_eq!(read_back.history_token, Some("tok-1".to_string()));
    }
}
