//! Poller (C9): one tick for a `(user, source)` pair. Reads the
//! SyncCursor, polls the adapter, enqueues every changed id as an
//! Ingest (and every deleted id as a deletion), then writes the new
//! cursor back only after all enqueues succeed (§4.9).

use std::sync::Arc;

use tokio::sync::Semaphore;
use uuid::Uuid;

use super::IngestQueue;
use crate::error::CoreError;
use crate::model::Source;
use crate::providers::ProviderAdapter;
use crate::store::RecordStore;

/// Default per-user concurrent-Ingest cap (§4.9).
pub const DEFAULT_CONCURRENCY_PER_USER: usize = 4;

/// What a single poll tick observed, fed straight into
/// `Scheduler::record_poll_outcome` (§4.9, §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTickOutcome {
    /// Changed + deleted ids enqueued this tick.
    pub enqueued: usize,
    /// Whether any changed Mail item carried the `ai+<username>@`
    /// virtual-mail address (§4.1) — folded into the Scheduler's
    /// interval halving (§4.10).
    pub virtual_mail_activity: bool,
}

pub struct Poller<'a> {
    store: &'a dyn RecordStore,
    queue: &'a dyn IngestQueue,
    concurrency_per_user: usize,
}

impl<'a> Poller<'a> {
    pub fn new(store: &'a dyn RecordStore, queue: &'a dyn IngestQueue) -> Self {
        Self {
            store,
            queue,
            concurrency_per_user: DEFAULT_CONCURRENCY_PER_USER,
        }
    }

    pub fn with_concurrency(mut self, concurrency_per_user: usize) -> Self {
        self.concurrency_per_user = concurrency_per_user;
        self
    }

    /// One poll tick for `owner_id` against `adapter`. Returns the number
    /// of ids enqueued (changed + deleted) and whether any changed Mail
    /// item was virtual-mail, for observability and the Scheduler.
    pub async fn tick(
        &self,
        owner_id: Uuid,
        adapter: &dyn ProviderAdapter,
    ) -> Result<PollTickOutcome, CoreError> {
        let source = adapter.source();
        let cursor = self.store.get_cursor(owner_id, source).await?;

        let result = adapter
            .poll(owner_id, cursor.history_token.as_deref())
            .await?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency_per_user.max(1)));
        let mut enqueued = 0usize;
        let mut virtual_mail_activity = false;

        for source_id in &result.changed_source_ids {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            if source == Source::Mail && !virtual_mail_activity {
                if let Ok(raw) = adapter.fetch_item(owner_id, source_id).await {
                    if raw.metadata.contains_key("virtual_username") {
                        virtual_mail_activity = true;
                    }
                }
            }
            self.queue.enqueue(owner_id, source, source_id.clone()).await;
            enqueued += 1;
        }

        for source_id in &result.deleted_source_ids {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            self.queue
                .enqueue_deletion(owner_id, source, source_id.clone())
                .await;
            enqueued += 1;
        }

        if let Some(new_token) = result.new_history_token {
            let mut updated = cursor;
            updated.history_token = Some(new_token);
            updated.last_successful_poll = Some(chrono::Utc::now());
            self.store.save_cursor(&updated).await?;
        }

        Ok(PollTickOutcome {
            enqueued,
            virtual_mail_activity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;
    use crate::providers::fixture::FixtureAdapter;
    use crate::providers::RawItem;
    use crate::store::mem::MemStore;
    use crate::sync::RecordingQueue;
    use chrono::Utc;

    fn raw(id: &str) -> RawItem {
        RawItem {
            source_id: id.to_string(),
            title: "t".to_string(),
            author: "a@example.test".to_string(),
            received_at: Utc::now(),
            body: "b".to_string(),
            revision: "r1".to_string(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn tick_enqueues_changed_items_and_advances_cursor() {
        let owner = Uuid::new_v4();
        let adapter = FixtureAdapter::new(Source::Mail);
        adapter.seed_item(raw("m1"));
        adapter.seed_item(raw("m2"));

        let store = MemStore::new();
        let queue = RecordingQueue::new();
        let poller = Poller::new(&store, &queue);

        let outcome = poller.tick(owner, &adapter).await.unwrap();
        assert_eq!(outcome.enqueued, 2);
        assert!(!outcome.virtual_mail_activity);
        assert_eq!(queue.drain().len(), 2);

        let cursor = store.get_cursor(owner, Source::Mail).await.unwrap();
        assert!(cursor.history_token.is_some());
    }

    #[tokio::test]
    async fn tick_enqueues_deletions_separately() {
        let owner = Uuid::new_v4();
        let adapter = FixtureAdapter::new(Source::Drive);
        adapter.seed_item(raw("d1"));
        let store = MemStore::new();
        let queue = RecordingQueue::new();
        let poller = Poller::new(&store, &queue);
        poller.tick(owner, &adapter).await.unwrap();
        queue.drain();

        adapter.delete_item("d1");
        poller.tick(owner, &adapter).await.unwrap();
        assert_eq!(queue.drain_deletions().len(), 1);
    }

    #[tokio::test]
    async fn transient_poll_failure_leaves_cursor_untouched() {
        let owner = Uuid::new_v4();
        let adapter = FixtureAdapter::new(Source::Calendar);
        adapter.fail_next_poll();
        let store = MemStore::new();
        let queue = RecordingQueue::new();
        let poller = Poller::new(&store, &queue);

        let before = store.get_cursor(owner, Source::Calendar).await.unwrap();
        let err = poller.tick(owner, &adapter).await.unwrap_err();
        assert!(err.is_transient());
        let after = store.get_cursor(owner, Source::Calendar).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn tick_reports_virtual_mail_activity() {
        let owner = Uuid::new_v4();
        let adapter = FixtureAdapter::new(Source::Mail);
        let mut item = raw("m3");
        item.metadata.insert("virtual_username".to_string(), "alice".to_string());
        adapter.seed_item(item);

        let store = MemStore::new();
        let queue = RecordingQueue::new();
        let poller = Poller::new(&store, &queue);

        let outcome = poller.tick(owner, &adapter).await.unwrap();
        assert!(outcome.virtual_mail_activity);
    }

    #[tokio::test]
    async fn tick_does_not_report_virtual_mail_activity_for_plain_mail() {
        let owner = Uuid::new_v4();
        let adapter = FixtureAdapter::new(Source::Mail);
        adapter.seed_item(raw("m4"));

        let store = MemStore::new();
        let queue = RecordingQueue::new();
        let poller = Poller::new(&store, &queue);

        let outcome = poller.tick(owner, &adapter).await.unwrap();
        assert!(!outcome.virtual_mail_activity);
    }
}
