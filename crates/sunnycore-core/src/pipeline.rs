//! Item Pipeline (C7): `Ingest(user, source, source_id) -> Outcome`, the
//! seven-step state machine of §4.7: atomic-upsert-then-stage across the
//! three sources, with a classify-then-chunk-then-embed flow in the
//! middle.

use std::time::Instant;

use uuid::Uuid;

use crate::chunker::{Chunker, ItemContext};
use crate::classify::{ChatModel, Classifier};
use crate::config::Settings;
use crate::embeddings::Embedder;
use crate::error::CoreError;
use crate::model::{Item, ItemMetadata, ItemStatus, Outcome, ProcessingLog, Source};
use crate::providers::ProviderAdapter;
use crate::search::{chunk_to_metadata, EmbeddingRecord, VectorIndex};
use crate::store::{is_unchanged_duplicate, RecordStore, UpsertOutcome};

/// A drive item embedded as a link inside a mail item (§4.7 last
/// paragraph). The mail item's project id rides along as a hint; the
/// Classifier still makes its own decision when the drive item is
/// ingested.
#[derive(Debug, Clone)]
pub struct FanOutIngest {
    pub source: Source,
    pub source_id: String,
    pub project_hint: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub outcome: Outcome,
    pub fan_out: Vec<FanOutIngest>,
}

/// Metadata key `mail::RawItem` adapters may set on a mail item to
/// signal embedded Drive file links — a comma-separated list of Drive
/// source ids. Not part of any existing adapter convention; introduced
/// here as the fan-out boundary §4.7 requires.
pub const DRIVE_LINK_METADATA_KEY: &str = "drive_link_ids";

pub struct Pipeline<'a, M: ChatModel> {
    pub adapter: &'a dyn ProviderAdapter,
    pub store: &'a dyn RecordStore,
    pub vector_index: &'a dyn VectorIndex,
    pub classifier: &'a Classifier<M>,
    pub chunker: &'a Chunker<'a, Embedder, M>,
    pub embedder: &'a Embedder,
    pub settings: &'a Settings,
    pub domain: &'a str,
}

impl<'a, M: ChatModel> Pipeline<'a, M> {
    pub async fn ingest(&self, owner_id: Uuid, source_id: &str) -> Result<IngestResult, CoreError> {
        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let source = self.adapter.source();

        let result = self.run(owner_id, source, source_id).await;

        let (outcome, error_kind, detail, fan_out) = match &result {
            Ok(r) => (r.outcome, None, None, r.fan_out.clone()),
            Err(e) => (Outcome::Failed, Some(e.kind()), Some(e.to_string()), Vec::new()),
        };

        // Best-effort logging: a logging failure must never mask the
        // underlying ingest result (§4.2, §4.7 step 7).
        if let Some(item) = self
            .store
            .get_item_by_source_id(source, source_id)
            .await
            .ok()
            .flatten()
        {
            let log = ProcessingLog {
                id: Uuid::new_v4(),
                item_id: item.id,
                owner_id,
                outcome,
                error_kind,
                detail,
                started_at,
                duration_ms: start.elapsed().as_millis() as u64,
            };
            if let Err(e) = self.store.insert_log(&log).await {
                tracing::warn!(error = %e, "failed to write processing log");
            }
        }

        result
    }

    async fn run(
        &self,
        owner_id: Uuid,
        source: Source,
        source_id: &str,
    ) -> Result<IngestResult, CoreError> {
        // Step 1: atomic upsert / duplicate short-circuit.
        let (mut item, upsert_outcome) =
            self.store.upsert_item_stub(owner_id, source, source_id).await?;

        // Step 2: fetch.
        let raw = match self.adapter.fetch_item(owner_id, source_id).await {
            Ok(raw) => raw,
            Err(e) if e.is_transient() => {
                return Ok(IngestResult {
                    outcome: Outcome::Failed,
                    fan_out: Vec::new(),
                })
            }
            Err(e) => return Err(e),
        };

        if upsert_outcome == UpsertOutcome::Existing && is_unchanged_duplicate(&item, &raw.revision)
        {
            return Ok(IngestResult {
                outcome: Outcome::Duplicate,
                fan_out: Vec::new(),
            });
        }
        let is_update = upsert_outcome == UpsertOutcome::Existing;

        // Step 3: extract plain text + typed metadata.
        let (body, metadata) = extract(source, &raw);
        item.title = raw.title.clone();
        item.author = raw.author.clone();
        item.received_at = raw.received_at;
        item.body = body.clone();
        item.metadata = metadata;
        item.revision = raw.revision.clone();

        // Step 4: classify.
        let candidates = self.store.list_active_projects_for_user(owner_id).await?;
        let matched = self.classifier.classify(&body, &candidates).await;
        item.project_id = matched.map(|p| p.id);

        if matched.is_none() {
            // A previously embedded item can lose its classification on
            // re-ingest (project archived, classifier outage); its stale
            // vectors must go before the row is marked unclassified (I5).
            if is_update {
                self.vector_index.delete_by_item(item.id).await?;
            }
            item.status = ItemStatus::Unclassified;
            self.store.save_item(&item).await?;
            return Ok(IngestResult {
                outcome: Outcome::Created,
                fan_out: drive_link_fan_out(&raw, None),
            });
        }
        item.status = ItemStatus::Classified;

        // Step 5: chunk.
        let ctx = ItemContext {
            title: &item.title,
            author: &item.author,
            source,
            received_at: item.received_at,
        };
        let chunks = self.chunker.chunk_contextual(item.id, &body, &ctx).await?;

        // Step 6: embed + upsert vectors.
        if is_update {
            self.vector_index.delete_by_item(item.id).await?;
        }
        let vectors = self.embedder.embed_chunks(&chunks).await?;
        let records: Vec<EmbeddingRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddingRecord {
                metadata: chunk_to_metadata(
                    chunk,
                    owner_id,
                    item.project_id,
                    source,
                    &item.title,
                    &item.author,
                    item.received_at,
                ),
                vector,
            })
            .collect();
        self.vector_index.upsert(records).await?;

        item.status = ItemStatus::Embedded;
        self.store.save_item(&item).await?;

        Ok(IngestResult {
            outcome: if is_update { Outcome::Updated } else { Outcome::Created },
            fan_out: drive_link_fan_out(&raw, item.project_id),
        })
    }

    /// §4.7 deletion branch: vectors go first, the invariant in §3 that
    /// forbids a deleted row with live vectors depends on this order.
    pub async fn delete(&self, item_id: Uuid) -> Result<(), CoreError> {
        self.vector_index.delete_by_item(item_id).await?;
        self.store.soft_delete_item(item_id).await
    }
}

fn drive_link_fan_out(
    raw: &crate::providers::RawItem,
    project_hint: Option<Uuid>,
) -> Vec<FanOutIngest> {
    raw.metadata
        .get(DRIVE_LINK_METADATA_KEY)
        .map(|ids| {
            ids.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|id| FanOutIngest {
                    source: Source::Drive,
                    source_id: id.to_string(),
                    project_hint,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Plain-text extraction + typed metadata per source (§4.7 step 3).
fn extract(source: Source, raw: &crate::providers::RawItem) -> (String, ItemMetadata) {
    match source {
        Source::Mail => {
            let body = strip_html_if_needed(&raw.body);
            let metadata = ItemMetadata::Mail {
                headers: raw.metadata.clone(),
                attachments: raw
                    .metadata
                    .get("attachments")
                    .map(|a| a.split(',').map(str::trim).map(String::from).collect())
                    .unwrap_or_default(),
            };
            (body, metadata)
        }
        Source::Drive => {
            let mime_type = raw
                .metadata
                .get("mime_type")
                .cloned()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let size_bytes = raw
                .metadata
                .get("size_bytes")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let body = if raw.body.is_empty() {
                format!("[{}] {}", mime_type, raw.title)
            } else {
                raw.body.clone()
            };
            let metadata = ItemMetadata::Drive {
                mime_type,
                size_bytes,
                revision: raw.revision.clone(),
            };
            (body, metadata)
        }
        Source::Calendar => {
            let attendees: Vec<String> = raw
                .metadata
                .get("attendees")
                .map(|a| a.split(',').map(str::trim).map(String::from).collect())
                .unwrap_or_default();
            let body = format!("{}\n\n{}\n\nAttendees: {}", raw.title, raw.body, attendees.join(", "));
            let metadata = ItemMetadata::Calendar {
                attendees,
                start: raw.received_at,
                end: raw.received_at,
            };
            (body, metadata)
        }
    }
}

fn strip_html_if_needed(body: &str) -> String {
    if !body.contains('<') {
        return body.to_string();
    }
    let mut out = String::with_capacity(body.len());
    let mut in_tag = false;
    for c in body.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FakeChatModel;
    use crate::providers::fixture::FixtureAdapter;
    use crate::providers::RawItem;
    use crate::search::MemVectorIndex;
    use crate::store::mem::MemStore;
    use chrono::Utc;
    use std::collections::HashMap;

    fn settings() -> Settings {
        Settings::default()
    }

    fn raw(id: &str, body: &str) -> RawItem {
        RawItem {
            source_id: id.to_string(),
            title: "Q3 roadmap".to_string(),
            author: "alice@example.test".to_string(),
            received_at: Utc::now(),
            body: body.to_string(),
            revision: "r1".to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn unclassified_item_is_created_without_embedding() {
        let owner = Uuid::new_v4();
        let adapter = FixtureAdapter::new(Source::Mail);
        adapter.seed_item(raw("m1", "quarterly roadmap notes"));

        let store = MemStore::new();
        let vector_index = MemVectorIndex::new();
        let embedder = Embedder::mock(8);
        let chat = FakeChatModel::no_match();
        let classifier = Classifier::new(chat, 0.5);
        let settings = settings();
        let summarizer = FakeChatModel::no_match();
        let chunker = Chunker::new(&embedder, &summarizer, &settings);

        let pipeline = Pipeline {
            adapter: &adapter,
            store: &store,
            vector_index: &vector_index,
            classifier: &classifier,
            chunker: &chunker,
            embedder: &embedder,
            settings: &settings,
            domain: "example.test",
        };

        let result = pipeline.ingest(owner, "m1").await.unwrap();
        assert_eq!(result.outcome, Outcome::Created);

        let item = store.get_item_by_source_id(Source::Mail, "m1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Unclassified);
    }

    #[tokio::test]
    async fn repeated_ingest_of_embedded_item_is_duplicate() {
        let owner = Uuid::new_v4();
        let adapter = FixtureAdapter::new(Source::Mail);
        adapter.seed_item(raw("m2", "roadmap details for the quarter"));

        let store = MemStore::new();
        store.insert_project(crate::model::Project {
            id: Uuid::new_v4(),
            owner_id: owner,
            status: crate::model::ProjectStatus::Active,
            profile: Default::default(),
        });
        let projects = store.list_active_projects_for_user(owner).await.unwrap();

        let vector_index = MemVectorIndex::new();
        let embedder = Embedder::mock(8);
        let classifier = Classifier::new(FakeChatModel::matching(0, 0.9), 0.5);
        let settings = settings();
        let summarizer = FakeChatModel::matching(0, 0.9);
        let chunker = Chunker::new(&embedder, &summarizer, &settings);

        let pipeline = Pipeline {
            adapter: &adapter,
            store: &store,
            vector_index: &vector_index,
            classifier: &classifier,
            chunker: &chunker,
            embedder: &embedder,
            settings: &settings,
            domain: "example.test",
        };

        let first = pipeline.ingest(owner, "m2").await.unwrap();
        assert_eq!(first.outcome, Outcome::Created);
        let second = pipeline.ingest(owner, "m2").await.unwrap();
        assert_eq!(second.outcome, Outcome::Duplicate);

        let _ = projects;
    }

    #[tokio::test]
    async fn drive_link_in_mail_fans_out_to_drive_ingest() {
        let owner = Uuid::new_v4();
        let adapter = FixtureAdapter::new(Source::Mail);
        let mut item = raw("m3", "see the attached doc");
        item.metadata.insert(DRIVE_LINK_METADATA_KEY.to_string(), "d1,d2".to_string());
        adapter.seed_item(item);

        let store = MemStore::new();
        let vector_index = MemVectorIndex::new();
        let embedder = Embedder::mock(8);
        let classifier = Classifier::new(FakeChatModel::no_match(), 0.5);
        let settings = settings();
        let summarizer = FakeChatModel::no_match();
        let chunker = Chunker::new(&embedder, &summarizer, &settings);

        let pipeline = Pipeline {
            adapter: &adapter,
            store: &store,
            vector_index: &vector_index,
            classifier: &classifier,
            chunker: &chunker,
            embedder: &embedder,
            settings: &settings,
            domain: "example.test",
        };

        let result = pipeline.ingest(owner, "m3").await.unwrap();
        assert_eq!(result.fan_out.len(), 2);
        assert_eq!(result.fan_out[0].source, Source::Drive);
    }

    #[tokio::test]
    async fn reclassifying_to_unclassified_on_update_deletes_stale_vectors() {
        let owner = Uuid::new_v4();
        let adapter = FixtureAdapter::new(Source::Mail);
        adapter.seed_item(raw("m4", "quarterly roadmap notes"));

        let store = MemStore::new();
        store.insert_project(crate::model::Project {
            id: Uuid::new_v4(),
            owner_id: owner,
            status: crate::model::ProjectStatus::Active,
            profile: Default::default(),
        });

        let vector_index = MemVectorIndex::new();
        let embedder = Embedder::mock(8);
        let settings = settings();

        // First ingest: classifier matches, item is embedded with vectors.
        let classifier = Classifier::new(FakeChatModel::matching(0, 0.9), 0.5);
        let summarizer = FakeChatModel::matching(0, 0.9);
        let chunker = Chunker::new(&embedder, &summarizer, &settings);
        let pipeline = Pipeline {
            adapter: &adapter,
            store: &store,
            vector_index: &vector_index,
            classifier: &classifier,
            chunker: &chunker,
            embedder: &embedder,
            settings: &settings,
            domain: "example.test",
        };
        let first = pipeline.ingest(owner, "m4").await.unwrap();
        assert_eq!(first.outcome, Outcome::Created);

        let item = store.get_item_by_source_id(Source::Mail, "m4").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Embedded);

        let filter = crate::search::VectorFilter {
            user_id: None,
            project_id: None,
            source: None,
        };
        let hits_before = vector_index.query(&[0.0; 8], &filter, 10).await.unwrap();
        assert!(hits_before.iter().any(|h| h.item_id == item.id));

        // Second ingest: a changed revision (e.g. the project was archived
        // or the classifier is outaged) now yields no match.
        let mut updated = raw("m4", "quarterly roadmap notes, revised");
        updated.revision = "r2".to_string();
        adapter.seed_item(updated);

        let classifier = Classifier::new(FakeChatModel::no_match(), 0.5);
        let summarizer = FakeChatModel::no_match();
        let chunker = Chunker::new(&embedder, &summarizer, &settings);
        let pipeline = Pipeline {
            adapter: &adapter,
            store: &store,
            vector_index: &vector_index,
            classifier: &classifier,
            chunker: &chunker,
            embedder: &embedder,
            settings: &settings,
            domain: "example.test",
        };
        let second = pipeline.ingest(owner, "m4").await.unwrap();
        assert_eq!(second.outcome, Outcome::Created);

        let item = store.get_item_by_source_id(Source::Mail, "m4").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Unclassified);

        let hits_after = vector_index.query(&[0.0; 8], &filter, 10).await.unwrap();
        assert!(!hits_after.iter().any(|h| h.item_id == item.id));
    }
}
