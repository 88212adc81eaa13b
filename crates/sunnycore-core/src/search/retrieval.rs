//! Retrieval (C12): `search(query, user_id, project_id?, k)`, combining a
//! dense pass through the Vector Index with an in-process sparse BM25
//! pass over candidate Items' enriched text (§4.12), computed directly
//! against the standard Okapi BM25 formula rather than delegating to
//! milli's own hybrid ranking.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{VectorFilter, VectorIndex};
use crate::error::CoreError;
use crate::model::{Item, Source};
use crate::store::RecordStore;

const DENSE_WEIGHT: f32 = 0.7;
const SPARSE_WEIGHT: f32 = 0.3;
const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;
const ASSUMED_AVG_DOC_LENGTH: f32 = 100.0;
const DENSE_TOP_K_PER_VARIANT: usize = 20;
const MAX_QUERY_VARIANTS: usize = 3;
const MAX_TOTAL_BOOST: f32 = 2.0;
const CONTENT_TYPE_BOOST: f32 = 1.2;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "of", "to", "in", "on", "for", "with", "is", "are",
    "was", "were", "this", "that", "it", "as", "at", "by", "be", "from",
];

/// A small domain lexicon for non-LLM synonym expansion (§4.12 step 1).
/// Intentionally short: this rewriter is a recall aid, not a thesaurus.
const SYNONYMS: &[(&str, &str)] = &[
    ("meeting", "call"),
    ("call", "meeting"),
    ("doc", "document"),
    ("document", "doc"),
    ("invoice", "bill"),
    ("deadline", "due date"),
    ("update", "status"),
];

#[derive(Debug, Clone)]
pub struct RankedMatch {
    pub item_id: Uuid,
    pub chunk_index: u32,
    pub title: String,
    pub author: String,
    pub enriched_text: String,
    pub source: Source,
    pub received_at: DateTime<Utc>,
    pub score: f32,
}

/// Caller-supplied context used for the person-overlap boost (§4.12 step
/// 4); optional because most callers don't have one.
#[derive(Debug, Clone, Default)]
pub struct RetrievalContext {
    pub mentioned_people: Vec<String>,
}

pub struct Retriever<'a, V, E> {
    store: &'a dyn RecordStore,
    vector_index: &'a V,
    embedder: &'a E,
}

/// Narrow trait so Retrieval only needs `embed_query`, not the whole of
/// `embeddings::Embedder`.
#[async_trait::async_trait]
pub trait QueryEmbedder: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CoreError>;
}

#[async_trait::async_trait]
impl QueryEmbedder for crate::embeddings::Embedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CoreError> {
        crate::embeddings::Embedder::embed_query(self, text).await
    }
}

impl<'a, V: VectorIndex, E: QueryEmbedder> Retriever<'a, V, E> {
    pub fn new(store: &'a dyn RecordStore, vector_index: &'a V, embedder: &'a E) -> Self {
        Self {
            store,
            vector_index,
            embedder,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        user_id: Uuid,
        project_id: Option<Uuid>,
        k: usize,
        context: &RetrievalContext,
    ) -> Result<Vec<RankedMatch>, CoreError> {
        let variants = rewrite_query(query);

        let dense = self.dense_search(&variants, user_id, project_id).await;
        let candidates = self.store.list_items_for_user(user_id, project_id).await?;
        let sparse = sparse_search(query, &candidates);

        let (dense, dense_failed) = match dense {
            Ok(hits) => (hits, false),
            Err(e) => {
                tracing::warn!(error = %e, "dense search failed, falling back to sparse-only");
                (HashMap::new(), true)
            }
        };

        if dense_failed && sparse.is_empty() {
            return Err(CoreError::transient("both dense and sparse retrieval failed"));
        }

        let combined = combine(dense, sparse, &candidates, context);
        Ok(dedup_and_truncate(combined, k))
    }

    async fn dense_search(
        &self,
        variants: &[String],
        user_id: Uuid,
        project_id: Option<Uuid>,
    ) -> Result<HashMap<(Uuid, u32), super::VectorHit>, CoreError> {
        let filter = VectorFilter {
            user_id: Some(user_id),
            project_id,
            source: None,
        };

        let mut best: HashMap<(Uuid, u32), super::VectorHit> = HashMap::new();
        for variant in variants {
            let vector = self.embedder.embed_query(variant).await?;
            let hits = self
                .vector_index
                .query(&vector, &filter, DENSE_TOP_K_PER_VARIANT)
                .await?;
            for hit in hits {
                let key = (hit.item_id, hit.chunk_index);
                match best.get(&key) {
                    Some(existing) if existing.score >= hit.score => {}
                    _ => {
                        best.insert(key, hit);
                    }
                }
            }
        }
        Ok(best)
    }
}

/// Up to three alternative phrasings: synonym substitution, a
/// question-word variant, and a narrowed (quoted) specificity variant.
/// The original query is always included and always first.
fn rewrite_query(query: &str) -> Vec<String> {
    let mut variants = vec![query.to_string()];

    let lower = query.to_lowercase();
    if let Some((from, to)) = SYNONYMS.iter().find(|(from, _)| lower.contains(*from)) {
        variants.push(lower.replacen(from, to, 1));
    }

    if !lower.starts_with("what") && !lower.starts_with("who") && !lower.starts_with("when") {
        variants.push(format!("what about {query}"));
    }

    variants.truncate(MAX_QUERY_VARIANTS);
    variants
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphabetic())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Okapi BM25 over candidate Items' enriched text (here, `title` + `body`,
/// since Items rather than individual Chunks are the sparse unit — §4.12
/// step 3 operates over "candidate Items' enriched-text metadata").
fn sparse_search(query: &str, candidates: &[Item]) -> HashMap<Uuid, f32> {
    let query_terms = tokenize(query);
    if query_terms.is_empty() || candidates.is_empty() {
        return HashMap::new();
    }

    let docs: Vec<(Uuid, Vec<String>)> = candidates
        .iter()
        .map(|item| (item.id, tokenize(&format!("{} {}", item.title, item.body))))
        .collect();

    let n = docs.len() as f32;
    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for (_, terms) in &docs {
        let unique: HashSet<&str> = terms.iter().map(|t| t.as_str()).collect();
        for term in unique {
            *doc_freq.entry(term).or_insert(0) += 1;
        }
    }

    let mut scores = HashMap::new();
    for (item_id, terms) in &docs {
        let doc_len = terms.len() as f32;
        let mut term_freq: HashMap<&str, usize> = HashMap::new();
        for t in terms {
            *term_freq.entry(t.as_str()).or_insert(0) += 1;
        }

        let mut score = 0.0f32;
        for q in &query_terms {
            let tf = *term_freq.get(q.as_str()).unwrap_or(&0) as f32;
            if tf == 0.0 {
                continue;
            }
            let df = *doc_freq.get(q.as_str()).unwrap_or(&0) as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            let numerator = tf * (BM25_K1 + 1.0);
            let denominator =
                tf + BM25_K1 * (1.0 - BM25_B + BM25_B * (doc_len / ASSUMED_AVG_DOC_LENGTH));
            score += idf * (numerator / denominator);
        }
        if score > 0.0 {
            scores.insert(*item_id, score);
        }
    }
    scores
}

fn recency_boost(received_at: DateTime<Utc>) -> f32 {
    let age_days = (Utc::now() - received_at).num_days().max(0) as f32;
    if age_days < 1.0 {
        1.2
    } else if age_days < 7.0 {
        1.1
    } else {
        1.0
    }
}

fn content_type_boost(source: Source) -> f32 {
    match source {
        Source::Mail | Source::Calendar => CONTENT_TYPE_BOOST,
        Source::Drive => 1.0,
    }
}

fn person_boost(author: &str, context: &RetrievalContext) -> f32 {
    if context
        .mentioned_people
        .iter()
        .any(|p| author.eq_ignore_ascii_case(p))
    {
        1.1
    } else {
        1.0
    }
}

fn combine(
    dense: HashMap<(Uuid, u32), super::VectorHit>,
    sparse: HashMap<Uuid, f32>,
    candidates: &[Item],
    context: &RetrievalContext,
) -> Vec<RankedMatch> {
    let items_by_id: HashMap<Uuid, &Item> = candidates.iter().map(|i| (i.id, i)).collect();
    let mut keys: HashSet<(Uuid, u32)> = dense.keys().copied().collect();
    for item_id in sparse.keys() {
        keys.insert((*item_id, 0));
    }

    let mut matches = Vec::new();
    for key @ (item_id, chunk_index) in keys {
        let Some(item) = items_by_id.get(&item_id) else {
            continue;
        };

        let dense_score = dense.get(&key).map(|h| h.score).unwrap_or(0.0);
        let sparse_score = sparse.get(&item_id).copied().unwrap_or(0.0);
        let base = DENSE_WEIGHT * dense_score.min(1.0) + SPARSE_WEIGHT * sparse_score.min(1.0);

        let boost = (recency_boost(item.received_at)
            * person_boost(&item.author, context)
            * content_type_boost(item.source))
        .min(MAX_TOTAL_BOOST);

        let enriched_text = dense
            .get(&key)
            .map(|h| h.enriched_text.clone())
            .unwrap_or_else(|| item.body.clone());

        matches.push(RankedMatch {
            item_id,
            chunk_index,
            title: item.title.clone(),
            author: item.author.clone(),
            enriched_text,
            source: item.source,
            received_at: item.received_at,
            score: base * boost,
        });
    }

    matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    matches
}

fn dedup_and_truncate(matches: Vec<RankedMatch>, k: usize) -> Vec<RankedMatch> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(k);
    for m in matches {
        let prefix: String = m.enriched_text.chars().take(200).collect();
        let mut hasher = DefaultHasher::new();
        prefix.hash(&mut hasher);
        let digest = hasher.finish();
        if seen.insert(digest) {
            out.push(m);
            if out.len() == k {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemMetadata, ItemStatus};
    use crate::search::MemVectorIndex;
    use crate::store::mem::MemStore;

    fn item(id: Uuid, owner_id: Uuid, title: &str, body: &str, source: Source) -> Item {
        Item {
            id,
            source,
            source_id: id.to_string(),
            owner_id,
            project_id: None,
            title: title.to_string(),
            author: "alice@example.test".to_string(),
            received_at: Utc::now(),
            body: body.to_string(),
            metadata: match source {
                Source::Mail => ItemMetadata::Mail {
                    headers: Default::default(),
                    attachments: Vec::new(),
                },
                Source::Drive => ItemMetadata::Drive {
                    mime_type: "text/plain".to_string(),
                    size_bytes: 0,
                    revision: "1".to_string(),
                },
                Source::Calendar => ItemMetadata::Calendar {
                    attendees: Vec::new(),
                    start: Utc::now(),
                    end: Utc::now(),
                },
            },
            status: ItemStatus::Embedded,
            revision: "1".to_string(),
        }
    }

    #[test]
    fn bm25_prefers_documents_with_more_query_term_occurrences() {
        let owner = Uuid::new_v4();
        let a = item(
            Uuid::new_v4(),
            owner,
            "roadmap",
            "quarterly roadmap roadmap planning roadmap",
            Source::Drive,
        );
        let b = item(Uuid::new_v4(), owner, "unrelated", "lunch menu today", Source::Drive);
        let scores = sparse_search("roadmap", &[a.clone(), b.clone()]);
        assert!(scores.contains_key(&a.id));
        assert!(!scores.contains_key(&b.id));
    }

    #[test]
    fn rewrite_query_always_includes_the_original_first() {
        let variants = rewrite_query("schedule a meeting");
        assert_eq!(variants[0], "schedule a meeting");
        assert!(variants.len() <= MAX_QUERY_VARIANTS);
    }

    #[test]
    fn dedup_collapses_near_identical_prefixes() {
        let owner = Uuid::new_v4();
        let it = item(Uuid::new_v4(), owner, "t", "same opening text here", Source::Mail);
        let matches = vec![
            RankedMatch {
                item_id: it.id,
                chunk_index: 0,
                title: it.title.clone(),
                author: it.author.clone(),
                enriched_text: "same opening text here and more".to_string(),
                source: it.source,
                received_at: it.received_at,
                score: 0.9,
            },
            RankedMatch {
                item_id: it.id,
                chunk_index: 1,
                title: it.title.clone(),
                author: it.author.clone(),
                enriched_text: "same opening text here and more, continued".to_string(),
                source: it.source,
                received_at: it.received_at,
                score: 0.8,
            },
        ];
        let out = dedup_and_truncate(matches, 10);
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn search_falls_back_to_sparse_when_dense_index_is_empty() {
        let owner = Uuid::new_v4();
        let store = MemStore::new();
        let it = item(Uuid::new_v4(), owner, "Q3 roadmap", "roadmap planning doc", Source::Drive);
        store.save_item(&it).await.unwrap();

        let vector_index = MemVectorIndex::new();
        struct ZeroEmbedder;
        #[async_trait::async_trait]
        impl QueryEmbedder for ZeroEmbedder {
            async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, CoreError> {
                Ok(vec![0.0; 4])
            }
        }
        let embedder = ZeroEmbedder;
        let retriever = Retriever::new(&store, &vector_index, &embedder);

        let results = retriever
            .search("roadmap", owner, None, 5, &RetrievalContext::default())
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].item_id, it.id);
    }
}
