//! Vector Index (C3): a milli-backed store of Embeddings, keyed by
//! `user_id`/`project_id`/`source`/`item_id`/`chunk_index` metadata (§3).
//! Hybrid dense+sparse retrieval scoring lives in `retrieval`; this
//! module only owns upsert/delete/raw-query against the index.

pub mod retrieval;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bumpalo::Bump;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use milli::documents::mmap_from_objects;
use milli::heed::EnvOpenOptions;
use milli::progress::Progress;
use milli::prompt::Prompt;
use milli::score_details::ScoringStrategy;
use milli::update::new::indexer::{self, DocumentOperation};
use milli::update::{IndexerConfig, Setting};
use milli::vector::settings::{EmbedderSource, EmbeddingSettings};
use milli::vector::{embedder::manual, Embedder as MilliEmbedder, RuntimeEmbedder, RuntimeEmbedders};
use milli::{FilterableAttributesRule, Index, TermsMatchingStrategy};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{Chunk, EmbeddingMetadata, Source};

const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024 * 1024;
const EMBEDDER_NAME: &str = "default";

/// What a caller upserts: one Chunk's metadata plus its vector.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub metadata: EmbeddingMetadata,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub user_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub source: Option<Source>,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub item_id: Uuid,
    pub chunk_index: u32,
    pub enriched_text: String,
    pub title: String,
    pub author: String,
    pub received_at: DateTime<Utc>,
    pub score: f32,
}

/// Dense-vector lookup behind a trait so Retrieval and the Pipeline don't
/// depend on milli directly; `MemVectorIndex` backs every test in this
/// crate that isn't specifically exercising the milli wiring.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, records: Vec<EmbeddingRecord>) -> Result<(), CoreError>;

    /// Removes every Embedding for `item_id`. Must be called, and must
    /// complete, before the Item row itself is deleted (§3 invariant).
    async fn delete_by_item(&self, item_id: Uuid) -> Result<(), CoreError>;

    async fn query(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>, CoreError>;
}

fn vector_id(item_id: Uuid, chunk_index: u32) -> String {
    format!("{item_id}:{chunk_index}")
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Linear-scan in-memory `VectorIndex`, adequate for the data volumes a
/// single test exercises.
#[derive(Default)]
pub struct MemVectorIndex {
    records: DashMap<String, EmbeddingRecord>,
}

impl MemVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for MemVectorIndex {
    async fn upsert(&self, records: Vec<EmbeddingRecord>) -> Result<(), CoreError> {
        for record in records {
            let id = vector_id(record.metadata.item_id, record.metadata.chunk_index);
            self.records.insert(id, record);
        }
        Ok(())
    }

    async fn delete_by_item(&self, item_id: Uuid) -> Result<(), CoreError> {
        self.records.retain(|_, r| r.metadata.item_id != item_id);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>, CoreError> {
        let mut hits: Vec<VectorHit> = self
            .records
            .iter()
            .filter(|r| {
                filter.user_id.is_none_or(|u| r.metadata.user_id == u)
                    && filter.project_id.is_none_or(|p| r.metadata.project_id == Some(p))
                    && filter.source.is_none_or(|s| r.metadata.source == s)
            })
            .map(|r| VectorHit {
                item_id: r.metadata.item_id,
                chunk_index: r.metadata.chunk_index,
                enriched_text: r.metadata.enriched_text.clone(),
                title: r.metadata.title.clone(),
                author: r.metadata.author.clone(),
                received_at: r.metadata.received_at,
                score: cosine(vector, &r.vector),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}

// ---------------------------------------------------------------------
// milli-backed implementation
// ---------------------------------------------------------------------

/// Opens (or creates) a milli index with the filterable fields Retrieval
/// and deletion need: `user_id`, `project_id`, `source`, `item_id`.
pub fn open_index(path: &Path) -> anyhow::Result<Index> {
    std::fs::create_dir_all(path)?;

    let mut env_options = EnvOpenOptions::new();
    env_options.map_size(DEFAULT_MAP_SIZE);
    let env_options = env_options.read_txn_without_tls();

    let index = Index::new(env_options, path, true).context("Failed to create milli index")?;

    let needs_setup = {
        let rtxn = index.read_txn()?;
        let current_rules = index.filterable_attributes_rules(&rtxn)?;
        let has_all = ["user_id", "project_id", "source", "item_id"].iter().all(|field| {
            current_rules
                .iter()
                .any(|rule| matches!(rule, FilterableAttributesRule::Field(f) if f == field))
        });
        !has_all
    };

    if needs_setup {
        let indexer_config = IndexerConfig::default();
        let mut wtxn = index.write_txn()?;
        let mut settings = milli::update::Settings::new(&mut wtxn, &index, &indexer_config);
        settings.set_primary_key("id".to_string());
        settings.set_filterable_fields(vec![
            FilterableAttributesRule::Field("user_id".to_string()),
            FilterableAttributesRule::Field("project_id".to_string()),
            FilterableAttributesRule::Field("source".to_string()),
            FilterableAttributesRule::Field("item_id".to_string()),
        ]);
        settings.execute(&|| false, &Progress::default(), Default::default())?;
        wtxn.commit()?;
        tracing::info!("Configured primary key and filterable attributes");
    }

    Ok(index)
}

fn create_user_provided_embedders(embedder_name: &str, dimensions: usize) -> RuntimeEmbedders {
    let manual_embedder = manual::Embedder::new(manual::EmbedderOptions {
        dimensions,
        distribution: None,
    });
    let embedder = Arc::new(MilliEmbedder::UserProvided(manual_embedder));
    let prompt = Prompt::default();
    let runtime_embedder = Arc::new(RuntimeEmbedder::new(embedder, prompt, vec![], false));
    let mut map = std::collections::HashMap::new();
    map.insert(embedder_name.to_string(), runtime_embedder);
    RuntimeEmbedders::new(map)
}

pub fn configure_embedder(
    index: &Index,
    indexer_config: &IndexerConfig,
    dimensions: usize,
) -> anyhow::Result<()> {
    let mut wtxn = index.write_txn()?;
    let mut settings = milli::update::Settings::new(&mut wtxn, index, indexer_config);

    let embedder_settings = EmbeddingSettings {
        source: Setting::Set(EmbedderSource::UserProvided),
        model: Setting::NotSet,
        revision: Setting::NotSet,
        pooling: Setting::NotSet,
        api_key: Setting::NotSet,
        dimensions: Setting::Set(dimensions),
        binary_quantized: Setting::NotSet,
        document_template: Setting::NotSet,
        document_template_max_bytes: Setting::NotSet,
        url: Setting::NotSet,
        indexing_fragments: Setting::NotSet,
        search_fragments: Setting::NotSet,
        request: Setting::NotSet,
        response: Setting::NotSet,
        headers: Setting::NotSet,
        search_embedder: Setting::NotSet,
        indexing_embedder: Setting::NotSet,
        distribution: Setting::NotSet,
    };

    let mut embedders_map = BTreeMap::new();
    embedders_map.insert(EMBEDDER_NAME.to_string(), Setting::Set(embedder_settings));
    settings.set_embedder_settings(embedders_map);
    settings.execute(&|| false, &Progress::default(), Default::default())?;
    wtxn.commit()?;
    Ok(())
}

fn get_embedder_from_index(
    index: &Index,
    rtxn: &milli::heed::RoTxn<'_>,
) -> anyhow::Result<Option<(Arc<MilliEmbedder>, bool)>> {
    let embedders = index.embedding_configs();
    if embedders.embedder_id(rtxn, EMBEDDER_NAME)?.is_none() {
        return Ok(None);
    }
    let configs = embedders.embedding_configs(rtxn)?;
    let config = configs.iter().find(|c| c.name == EMBEDDER_NAME);
    match config {
        Some(cfg) => {
            let embedder = MilliEmbedder::new(cfg.config.embedder_options.clone(), 0)
                .map_err(|e| anyhow::anyhow!("Failed to create embedder: {}", e))?;
            Ok(Some((Arc::new(embedder), cfg.config.quantized.unwrap_or(false))))
        }
        None => Ok(None),
    }
}

fn record_to_json(record: &EmbeddingRecord) -> Map<String, Value> {
    let m = &record.metadata;
    let mut doc = Map::new();
    doc.insert(
        "id".to_string(),
        Value::String(vector_id(m.item_id, m.chunk_index)),
    );
    doc.insert("user_id".to_string(), Value::String(m.user_id.to_string()));
    doc.insert(
        "project_id".to_string(),
        match m.project_id {
            Some(p) => Value::String(p.to_string()),
            None => Value::Null,
        },
    );
    doc.insert("source".to_string(), Value::String(m.source.as_str().to_string()));
    doc.insert("item_id".to_string(), Value::String(m.item_id.to_string()));
    doc.insert("chunk_index".to_string(), Value::Number(m.chunk_index.into()));
    doc.insert("enriched_text".to_string(), Value::String(m.enriched_text.clone()));
    doc.insert("title".to_string(), Value::String(m.title.clone()));
    doc.insert("author".to_string(), Value::String(m.author.clone()));
    doc.insert("received_at".to_string(), Value::String(m.received_at.to_rfc3339()));
    doc.insert(
        "_vectors".to_string(),
        serde_json::json!({ "default": [record.vector] }),
    );
    doc
}

fn index_records_batch(
    index: &Index,
    indexer_config: &IndexerConfig,
    records: &[EmbeddingRecord],
) -> anyhow::Result<()> {
    if records.is_empty() {
        return Ok(());
    }

    let json_docs: Vec<Map<String, Value>> = records.iter().map(record_to_json).collect();
    let mmap = mmap_from_objects(json_docs);

    let rtxn = index.read_txn()?;
    let db_fields_ids_map = index.fields_ids_map(&rtxn)?;
    let mut new_fields_ids_map = db_fields_ids_map.clone();

    let mut operation = DocumentOperation::new();
    operation.replace_documents(&mmap)?;

    let indexer_alloc = Bump::new();
    let (document_changes, operation_stats, primary_key) = operation.into_changes(
        &indexer_alloc,
        index,
        &rtxn,
        None,
        &mut new_fields_ids_map,
        &|| false,
        Progress::default(),
        None,
    )?;

    if let Some(error) = operation_stats.into_iter().find_map(|stat| stat.error) {
        anyhow::bail!("Document operation error: {}", error);
    }

    let mut wtxn = index.write_txn()?;
    let dimensions = records.first().map(|r| r.vector.len()).unwrap_or(0);
    let embedders = create_user_provided_embedders(EMBEDDER_NAME, dimensions);

    indexer_config
        .thread_pool
        .install(|| {
            indexer::index(
                &mut wtxn,
                index,
                &indexer_config.thread_pool,
                indexer_config.grenad_parameters(),
                &db_fields_ids_map,
                new_fields_ids_map,
                primary_key,
                &document_changes,
                embedders,
                &|| false,
                &Progress::default(),
                &Default::default(),
            )
        })
        .map_err(|e| anyhow::anyhow!("Thread pool error: {}", e))??;

    wtxn.commit()?;
    Ok(())
}

fn delete_ids_batch(
    index: &Index,
    indexer_config: &IndexerConfig,
    ids: &[String],
) -> anyhow::Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();

    let rtxn = index.read_txn()?;
    let db_fields_ids_map = index.fields_ids_map(&rtxn)?;
    let mut new_fields_ids_map = db_fields_ids_map.clone();

    let mut operation = DocumentOperation::new();
    operation.delete_documents(&refs);

    let indexer_alloc = Bump::new();
    let (document_changes, operation_stats, primary_key) = operation.into_changes(
        &indexer_alloc,
        index,
        &rtxn,
        None,
        &mut new_fields_ids_map,
        &|| false,
        Progress::default(),
        None,
    )?;

    if let Some(error) = operation_stats.into_iter().find_map(|stat| stat.error) {
        anyhow::bail!("Chunk deletion error: {}", error);
    }

    let mut wtxn = index.write_txn()?;
    indexer_config
        .thread_pool
        .install(|| {
            indexer::index(
                &mut wtxn,
                index,
                &indexer_config.thread_pool,
                indexer_config.grenad_parameters(),
                &db_fields_ids_map,
                new_fields_ids_map,
                primary_key,
                &document_changes,
                RuntimeEmbedders::default(),
                &|| false,
                &Progress::default(),
                &Default::default(),
            )
        })
        .map_err(|e| anyhow::anyhow!("Thread pool error: {}", e))??;

    wtxn.commit()?;
    Ok(())
}

fn get_document(
    index: &Index,
    rtxn: &milli::heed::RoTxn,
    doc_id: u32,
) -> anyhow::Result<Option<Map<String, Value>>> {
    let fields_ids_map = index.fields_ids_map(rtxn)?;
    let docs = index.documents(rtxn, [doc_id])?;
    if let Some((_id, obkv)) = docs.first() {
        Ok(Some(milli::all_obkv_to_json(obkv, &fields_ids_map)?))
    } else {
        Ok(None)
    }
}

fn doc_field_str(doc: &Map<String, Value>, field: &str) -> String {
    doc.get(field).and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

fn doc_to_hit(doc: &Map<String, Value>, score: f32) -> Option<VectorHit> {
    Some(VectorHit {
        item_id: doc_field_str(doc, "item_id").parse().ok()?,
        chunk_index: doc.get("chunk_index").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        enriched_text: doc_field_str(doc, "enriched_text"),
        title: doc_field_str(doc, "title"),
        author: doc_field_str(doc, "author"),
        received_at: doc_field_str(doc, "received_at")
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        score,
    })
}

fn build_filter(filter: &VectorFilter) -> Option<String> {
    let mut clauses = Vec::new();
    if let Some(user_id) = filter.user_id {
        clauses.push(format!("user_id = \"{user_id}\""));
    }
    if let Some(project_id) = filter.project_id {
        clauses.push(format!("project_id = \"{project_id}\""));
    }
    if let Some(source) = filter.source {
        clauses.push(format!("source = \"{}\"", source.as_str()));
    }
    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

/// Production `VectorIndex`, backed by milli with a user-provided
/// (pre-computed) embedder — this crate never asks milli to generate
/// vectors, only to store and rank the ones `embeddings::Embedder`
/// already produced.
pub struct MilliVectorIndex {
    index: Index,
    indexer_config: IndexerConfig,
}

impl MilliVectorIndex {
    pub fn open(path: &Path, dimensions: usize) -> anyhow::Result<Self> {
        let index = open_index(path)?;
        let indexer_config = IndexerConfig::default();
        configure_embedder(&index, &indexer_config, dimensions)?;
        Ok(Self {
            index,
            indexer_config,
        })
    }
}

#[async_trait]
impl VectorIndex for MilliVectorIndex {
    async fn upsert(&self, records: Vec<EmbeddingRecord>) -> Result<(), CoreError> {
        for batch in records.chunks(crate::embeddings::MAX_EMBED_BATCH) {
            index_records_batch(&self.index, &self.indexer_config, batch)
                .map_err(|e| CoreError::invariant(e.to_string()))?;
        }
        Ok(())
    }

    async fn delete_by_item(&self, item_id: Uuid) -> Result<(), CoreError> {
        let rtxn = self.index.read_txn().map_err(|e| CoreError::invariant(e.to_string()))?;
        let filter_str = format!("item_id = \"{item_id}\"");
        let mut search = milli::Search::new(&rtxn, &self.index);
        search.query("");
        search.limit(usize::MAX);
        if let Some(f) = milli::Filter::from_str(&filter_str)
            .map_err(|e| CoreError::invariant(format!("{e:?}")))?
        {
            search.filter(f);
        }
        let result = search.execute().map_err(|e| CoreError::invariant(e.to_string()))?;
        let ids: Vec<String> = result
            .documents_ids
            .iter()
            .filter_map(|&doc_id| {
                get_document(&self.index, &rtxn, doc_id)
                    .ok()
                    .flatten()
                    .map(|d| doc_field_str(&d, "id"))
            })
            .collect();
        drop(rtxn);

        delete_ids_batch(&self.index, &self.indexer_config, &ids)
            .map_err(|e| CoreError::invariant(e.to_string()))
    }

    async fn query(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>, CoreError> {
        let rtxn = self.index.read_txn().map_err(|e| CoreError::invariant(e.to_string()))?;
        let mut search = milli::Search::new(&rtxn, &self.index);
        search.query("");
        search.limit(limit);
        search.scoring_strategy(ScoringStrategy::Detailed);
        search.terms_matching_strategy(TermsMatchingStrategy::Last);

        if let Some(filter_str) = build_filter(filter) {
            if let Some(f) = milli::Filter::from_str(&filter_str)
                .map_err(|e| CoreError::invariant(format!("{e:?}")))?
            {
                search.filter(f);
            }
        }

        let Some((embedder, quantized)) = get_embedder_from_index(&self.index, &rtxn)
            .map_err(|e| CoreError::invariant(e.to_string()))?
        else {
            return Ok(Vec::new());
        };
        search.semantic(EMBEDDER_NAME.to_string(), embedder, quantized, Some(vector.to_vec()), None);

        let (result, _) = search
            .execute_hybrid(1.0)
            .map_err(|e| CoreError::invariant(e.to_string()))?;

        let hits = result
            .documents_ids
            .into_iter()
            .zip(result.document_scores)
            .filter_map(|(doc_id, scores)| {
                let score = milli::score_details::ScoreDetails::global_score(scores.iter()) as f32;
                get_document(&self.index, &rtxn, doc_id)
                    .ok()
                    .flatten()
                    .and_then(|doc| doc_to_hit(&doc, score))
            })
            .collect();

        Ok(hits)
    }
}

/// Produces the metadata half of an `EmbeddingRecord` from a `Chunk`.
pub fn chunk_to_metadata(
    chunk: &Chunk,
    user_id: Uuid,
    project_id: Option<Uuid>,
    source: Source,
    title: &str,
    author: &str,
    received_at: DateTime<Utc>,
) -> EmbeddingMetadata {
    EmbeddingMetadata {
        user_id,
        project_id,
        source,
        item_id: chunk.item_id,
        chunk_index: chunk.index,
        enriched_text: chunk.enriched_text.clone(),
        title: title.to_string(),
        author: author.to_string(),
        received_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(item_id: Uuid, chunk_index: u32, vector: Vec<f32>, user_id: Uuid) -> EmbeddingRecord {
        EmbeddingRecord {
            metadata: EmbeddingMetadata {
                user_id,
                project_id: None,
                source: Source::Mail,
                item_id,
                chunk_index,
                enriched_text: "summary\n\nbody".to_string(),
                title: "subject".to_string(),
                author: "alice@example.test".to_string(),
                received_at: Utc::now(),
            },
            vector,
        }
    }

    #[tokio::test]
    async fn mem_index_ranks_by_cosine_similarity() {
        let index = MemVectorIndex::new();
        let user_id = Uuid::new_v4();
        let item_a = Uuid::new_v4();
        let item_b = Uuid::new_v4();

        index
            .upsert(vec![
                record(item_a, 0, vec![1.0, 0.0], user_id),
                record(item_b, 0, vec![0.0, 1.0], user_id),
            ])
            .await
            .unwrap();

        let hits = index
            .query(&[1.0, 0.0], &VectorFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits[0].item_id, item_a);
    }

    #[tokio::test]
    async fn delete_by_item_removes_all_its_chunks() {
        let index = MemVectorIndex::new();
        let user_id = Uuid::new_v4();
        let item_id = Uuid::new_v4();

        index
            .upsert(vec![
                record(item_id, 0, vec![1.0, 0.0], user_id),
                record(item_id, 1, vec![0.9, 0.1], user_id),
            ])
            .await
            .unwrap();
        index.delete_by_item(item_id).await.unwrap();

        let hits = index
            .query(&[1.0, 0.0], &VectorFilter::default(), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn query_respects_user_filter() {
        let index = MemVectorIndex::new();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let item_a = Uuid::new_v4();
        let item_b = Uuid::new_v4();

        index
            .upsert(vec![
                record(item_a, 0, vec![1.0, 0.0], user_a),
                record(item_b, 0, vec![1.0, 0.0], user_b),
            ])
            .await
            .unwrap();

        let hits = index
            .query(
                &[1.0, 0.0],
                &VectorFilter {
                    user_id: Some(user_a),
                    ..Default::default()
                },
                10,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item_id, item_a);
    }
}
