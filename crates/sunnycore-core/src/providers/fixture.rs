//! In-memory, fixture-backed `ProviderAdapter` implementation.
//!
//! Suitable for self-hosted/test deployments where a real Gmail/Drive/
//! Calendar client isn't wired up (OAuth is out of scope, §1). Also the
//! adapter every pipeline/scheduler test in this crate is built against.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{Source, Watch};

use super::{PollResult, ProviderAdapter, RawItem};

#[derive(Debug, Clone)]
pub struct FixtureItem {
    pub raw: RawItem,
    pub deleted: bool,
}

/// A scripted, in-process provider. Items are seeded by the test/
/// operator; `poll` reports whatever has been added/deleted/updated
/// since the last call for that user.
pub struct FixtureAdapter {
    source: Source,
    items: Mutex<HashMap<String, FixtureItem>>,
    /// Items changed since the cursor value recorded here (keyed by the
    /// cursor token that was current when the change happened).
    pending_changes: Mutex<Vec<String>>,
    pending_deletions: Mutex<Vec<String>>,
    cursor_counter: Mutex<u64>,
    fail_next_poll: Mutex<bool>,
    fail_setup_watch: Mutex<bool>,
}

impl FixtureAdapter {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            items: Mutex::new(HashMap::new()),
            pending_changes: Mutex::new(Vec::new()),
            pending_deletions: Mutex::new(Vec::new()),
            cursor_counter: Mutex::new(0),
            fail_next_poll: Mutex::new(false),
            fail_setup_watch: Mutex::new(false),
        }
    }

    /// Seed (or update) an item and mark it as changed for the next poll.
    pub fn seed_item(&self, raw: RawItem) {
        let source_id = raw.source_id.clone();
        self.items.lock().unwrap().insert(
            source_id.clone(),
            FixtureItem {
                raw,
                deleted: false,
            },
        );
        self.pending_changes.lock().unwrap().push(source_id);
    }

    pub fn delete_item(&self, source_id: &str) {
        if let Some(entry) = self.items.lock().unwrap().get_mut(source_id) {
            entry.deleted = true;
        }
        self.pending_deletions
            .lock()
            .unwrap()
            .push(source_id.to_string());
    }

    /// Force the next `poll` call to return a `TransientError`, to
    /// exercise cursor-recovery behaviour (§8 scenario 5).
    pub fn fail_next_poll(&self) {
        *self.fail_next_poll.lock().unwrap() = true;
    }

    /// Makes every subsequent `setup_watch` call fail, to exercise the
    /// Watch Manager's three-strikes renewal-failure path (§4.11).
    pub fn fail_setup_watch(&self, fail: bool) {
        *self.fail_setup_watch.lock().unwrap() = fail;
    }
}

#[async_trait]
impl ProviderAdapter for FixtureAdapter {
    fn source(&self) -> Source {
        self.source
    }

    async fn setup_watch(
        &self,
        owner_id: Uuid,
        resource_id: Option<&str>,
    ) -> Result<Watch, CoreError> {
        if *self.fail_setup_watch.lock().unwrap() {
            return Err(CoreError::transient("fixture: simulated watch setup failure"));
        }
        Ok(Watch {
            id: Uuid::new_v4(),
            owner_id,
            source: self.source,
            resource_id: resource_id.map(String::from),
            channel_handle: format!("fixture-channel-{}", Uuid::new_v4()),
            expiry: Utc::now() + chrono::Duration::days(7),
            active: true,
            renewal_failures: 0,
        })
    }

    async fn poll(
        &self,
        _owner_id: Uuid,
        history_token: Option<&str>,
    ) -> Result<PollResult, CoreError> {
        if std::mem::take(&mut *self.fail_next_poll.lock().unwrap()) {
            return Err(CoreError::transient("fixture: simulated transient failure"));
        }

        let changed = std::mem::take(&mut *self.pending_changes.lock().unwrap());
        let deleted = std::mem::take(&mut *self.pending_deletions.lock().unwrap());

        if changed.is_empty() && deleted.is_empty() {
            return Ok(PollResult {
                changed_source_ids: Vec::new(),
                deleted_source_ids: Vec::new(),
                new_history_token: history_token.map(String::from),
            });
        }

        let mut counter = self.cursor_counter.lock().unwrap();
        *counter += 1;
        let new_token = counter.to_string();

        Ok(PollResult {
            changed_source_ids: changed,
            deleted_source_ids: deleted,
            new_history_token: Some(new_token),
        })
    }

    async fn fetch_item(&self, _owner_id: Uuid, source_id: &str) -> Result<RawItem, CoreError> {
        let items = self.items.lock().unwrap();
        match items.get(source_id) {
            Some(entry) if !entry.deleted => Ok(entry.raw.clone()),
            Some(_) => Err(CoreError::fatal(format!(
                "fixture: item {} was deleted",
                source_id
            ))),
            None => Err(CoreError::fatal(format!(
                "fixture: unknown item {}",
                source_id
            ))),
        }
    }

    async fn stop_watch(&self, _watch: &Watch) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raw(id: &str) -> RawItem {
        RawItem {
            source_id: id.to_string(),
            title: "Q3 planning".to_string(),
            author: "alice@example.test".to_string(),
            received_at: Utc::now(),
            body: "Let's meet Tuesday to review the Q3 roadmap.".to_string(),
            revision: "r1".to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn poll_reports_seeded_items_once() {
        let adapter = FixtureAdapter::new(Source::Mail);
        adapter.seed_item(sample_raw("m1"));

        let owner = Uuid::new_v4();
        let result = adapter.poll(owner, None).await.unwrap();
        assert_eq!(result.changed_source_ids, vec!["m1".to_string()]);
        assert!(result.new_history_token.is_some());

        // Second poll with no new activity reports nothing new.
        let result2 = adapter.poll(owner, result.new_history_token.as_deref()).await.unwrap();
        assert!(result2.changed_source_ids.is_empty());
    }

    #[tokio::test]
    async fn deleted_items_are_reported_and_unfetchable() {
        let adapter = FixtureAdapter::new(Source::Drive);
        adapter.seed_item(sample_raw("f1"));
        let owner = Uuid::new_v4();
        adapter.poll(owner, None).await.unwrap();

        adapter.delete_item("f1");
        let result = adapter.poll(owner, None).await.unwrap();
        assert_eq!(result.deleted_source_ids, vec!["f1".to_string()]);

        let fetch = adapter.fetch_item(owner, "f1").await;
        assert!(fetch.is_err());
    }

    #[tokio::test]
    async fn fail_next_poll_is_transient() {
        let adapter = FixtureAdapter::new(Source::Calendar);
        adapter.fail_next_poll();
        let err = adapter.poll(Uuid::new_v4(), None).await.unwrap_err();
        assert!(err.is_transient());
    }
}
