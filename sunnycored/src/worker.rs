//! In-process `IngestQueue`: runs the Item Pipeline (C7) for each
//! enqueued id immediately, bounded by a semaphore sized from
//! `Config::pipeline_worker_pool_size`. A bounded pool draining a queue
//! of work units, collapsed to the in-process case since this crate's
//! ingestion work units are cheap enough not to need a separate process
//! boundary (§5).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use uuid::Uuid;

use sunnycore_core::classify::ChatModel;
use sunnycore_core::model::Source;
use sunnycore_core::sync::IngestQueue;
use sunnycore_core::{App, Pipeline};

pub struct PipelineQueue<M: ChatModel> {
    app: Arc<App<M>>,
    permits: Arc<Semaphore>,
}

impl<M: ChatModel> PipelineQueue<M> {
    pub fn new(app: Arc<App<M>>) -> Self {
        let permits = Arc::new(Semaphore::new(app.config.pipeline_worker_pool_size.max(1)));
        Self { app, permits }
    }

    /// Runs the Pipeline for one id, under its own semaphore permit. The
    /// permit is released before any fan-out recursion so a pool size of
    /// one can never deadlock against its own fan-out (§5).
    async fn ingest_one(&self, owner_id: Uuid, source: Source, source_id: String) {
        let Some(adapter) = self.app.adapter_for(source) else {
            tracing::error!(%source, "no adapter configured for source, dropping ingest");
            return;
        };

        let fan_out = {
            let _permit = self.permits.acquire().await.expect("semaphore not closed");

            let chunker = self.app.chunker();
            let pipeline = Pipeline {
                adapter,
                store: &*self.app.store,
                vector_index: &*self.app.vector_index,
                classifier: &self.app.classifier,
                chunker: &chunker,
                embedder: &self.app.embedder,
                settings: &self.app.settings,
                domain: &self.app.config.mail_domain,
            };

            match pipeline.ingest(owner_id, &source_id).await {
                Ok(result) => {
                    tracing::info!(%owner_id, %source, source_id, outcome = ?result.outcome, "ingest complete");
                    result.fan_out
                }
                Err(e) => {
                    tracing::warn!(%owner_id, %source, source_id, error = %e, "ingest failed");
                    Vec::new()
                }
            }
        };

        for item in fan_out {
            Box::pin(self.ingest_one(owner_id, item.source, item.source_id)).await;
        }
    }

    async fn delete_one(&self, owner_id: Uuid, source: Source, source_id: String) {
        let _permit = self.permits.acquire().await.expect("semaphore not closed");

        let Some(item) = self
            .app
            .store
            .get_item_by_source_id(source, &source_id)
            .await
            .ok()
            .flatten()
        else {
            return;
        };

        if let Err(e) = self.app.vector_index.delete_by_item(item.id).await {
            tracing::error!(%owner_id, %source, source_id, error = %e, "failed to delete vectors before item row");
            return;
        }
        if let Err(e) = self.app.store.soft_delete_item(item.id).await {
            tracing::error!(%owner_id, %source, source_id, error = %e, "failed to soft-delete item row");
        }
    }
}

#[async_trait]
impl<M: ChatModel> IngestQueue for PipelineQueue<M> {
    async fn enqueue(&self, owner_id: Uuid, source: Source, source_id: String) {
        self.ingest_one(owner_id, source, source_id).await;
    }

    async fn enqueue_deletion(&self, owner_id: Uuid, source: Source, source_id: String) {
        self.delete_one(owner_id, source, source_id).await;
    }
}
