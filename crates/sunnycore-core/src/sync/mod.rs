//! Poller (C9), Scheduler (C10) and Watch Manager (C11) — the pull/push
//! half of ingestion, all driven off `ActivityMetric`/`Watch` rows
//! (§4.9–§4.11). Each spawns its own background task behind an owned
//! `CancellationToken`, one timer entry per `(user, source)`.

pub mod poller;
pub mod scheduler;
pub mod watch_manager;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::Source;

/// What the Poller and Push Handler both funnel Ingest requests through.
/// Kept as a trait so the Scheduler's worker pool (bounded concurrency,
/// §4.9/§5) is swappable in tests for a Vec-collecting fake.
#[async_trait]
pub trait IngestQueue: Send + Sync {
    async fn enqueue(&self, owner_id: Uuid, source: Source, source_id: String);

    /// A provider-reported deletion (§4.9); the caller resolves this to
    /// `Pipeline::delete`, not `Ingest`.
    async fn enqueue_deletion(&self, owner_id: Uuid, source: Source, source_id: String);
}

/// Test/diagnostic queue that just records what it was asked to do.
#[derive(Default)]
pub struct RecordingQueue {
    pub requests: parking_lot::Mutex<Vec<(Uuid, Source, String)>>,
    pub deletions: parking_lot::Mutex<Vec<(Uuid, Source, String)>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<(Uuid, Source, String)> {
        std::mem::take(&mut *self.requests.lock())
    }

    pub fn drain_deletions(&self) -> Vec<(Uuid, Source, String)> {
        std::mem::take(&mut *self.deletions.lock())
    }
}

#[async_trait]
impl IngestQueue for RecordingQueue {
    async fn enqueue(&self, owner_id: Uuid, source: Source, source_id: String) {
        self.requests.lock().push((owner_id, source, source_id));
    }

    async fn enqueue_deletion(&self, owner_id: Uuid, source: Source, source_id: String) {
        self.deletions.lock().push((owner_id, source, source_id));
    }
}

/// Raised when the Watch Manager can't renew a Watch three times running
/// (§4.11), after it has already halved that user/source's polling
/// interval via `scheduler::halve_interval_for_watch_failure` — this
/// trait is purely a notification hook, not the thing doing the halving.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn watch_renewal_failed(&self, owner_id: Uuid, source: Source, failures: u32);
}

pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn watch_renewal_failed(&self, owner_id: Uuid, source: Source, failures: u32) {
        tracing::error!(
            owner_id = %owner_id,
            source = %source,
            failures,
            "watch renewal failed three times in a row, polling interval halved until a human intervenes"
        );
    }
}

pub fn deadline_error() -> CoreError {
    CoreError::transient("pipeline execution exceeded its deadline")
}
