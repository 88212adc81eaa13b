//! Chunker (C4): turns extracted item text into an ordered list of
//! context-enriched `Chunk`s (§4.4).
//!
//! Sentence splitting and the cosine-similarity walk are pure functions
//! of the input text and sentence embeddings, matching the determinism
//! requirement in §3/§8 (I-equivalent: re-running on the same text yields
//! the same raw-text splits). Contextual summarisation is the one
//! non-deterministic step and is explicitly allowed to be (§9).
//!
//! Sentence embedding reuses the same underlying model as the Embedder
//! (C6) through the narrow `SentenceEmbedder` trait below, rather than
//! the document-level `embeddings::Embedder` API directly, so this
//! module doesn't need to know about batching or vector ids.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::classify::ChatModel;
use crate::config::Settings;
use crate::error::CoreError;
use crate::model::{Chunk, Source};

/// Embeds a batch of short strings (sentences) for the similarity walk.
/// `embeddings::Embedder` implements this directly; `search`'s
/// `MemVectorIndex`-oriented tests use a trivial hashing stand-in.
#[async_trait]
pub trait SentenceEmbedder: Send + Sync {
    async fn embed_sentences(&self, sentences: &[String]) -> Result<Vec<Vec<f32>>, CoreError>;
}

pub struct ItemContext<'a> {
    pub title: &'a str,
    pub author: &'a str,
    pub source: Source,
    pub received_at: DateTime<Utc>,
}

pub struct Chunker<'a, E, M> {
    embedder: &'a E,
    summarizer: &'a M,
    settings: &'a Settings,
}

impl<'a, E, M> Chunker<'a, E, M>
where
    E: SentenceEmbedder,
    M: ChatModel,
{
    pub fn new(embedder: &'a E, summarizer: &'a M, settings: &'a Settings) -> Self {
        Self {
            embedder,
            summarizer,
            settings,
        }
    }

    /// Default mode: one flat ordered list of chunks, sized by semantic
    /// similarity drop between adjacent sentences (§4.4 paragraph 1).
    pub async fn chunk_contextual(
        &self,
        item_id: uuid::Uuid,
        full_text: &str,
        ctx: &ItemContext<'_>,
    ) -> Result<Vec<Chunk>, CoreError> {
        let sentences = split_sentences(full_text);
        if sentences.is_empty() {
            return Ok(Vec::new());
        }

        let segments = if sentences.len() == 1 {
            vec![sentences]
        } else {
            let embeddings = self.embedder.embed_sentences(&sentences).await?;
            walk_similarity(sentences, &embeddings, self.settings.chunk_similarity_threshold)
        };

        let segments = merge_below_floor(segments, self.settings.chunk_token_floor);
        let segments = cap_at_ceiling(segments, self.settings.chunk_token_ceiling);

        let mut chunks = Vec::with_capacity(segments.len());
        for (index, segment) in segments.into_iter().enumerate() {
            let raw_text = segment.join(" ");
            let token_count = approx_token_count(&raw_text);

            let summary = match self.summarizer.summarize(full_text, &raw_text).await {
                Ok(s) if !s.trim().is_empty() => s,
                _ => fallback_summary(ctx),
            };

            let quality_score = score_quality(&raw_text, token_count, self.settings);
            if quality_score < self.settings.chunk_quality_floor {
                continue;
            }

            chunks.push(Chunk {
                item_id,
                index: index as u32,
                token_count,
                raw_text,
                enriched_text: format!("{summary}\n\n{}", segment.join(" ")),
                quality_score,
            });
        }

        // Re-number after any drops so `index` stays a dense 0..N sequence
        // (the vector id scheme `item_id:chunk_index` depends on this).
        for (new_index, chunk) in chunks.iter_mut().enumerate() {
            chunk.index = new_index as u32;
        }

        Ok(chunks)
    }

    /// Multi-granularity mode: four tiers (document, section, paragraph,
    /// sentence) with ceilings {2000, 800, 400, 200}, deduplicated across
    /// tiers by raw text (§4.4 paragraph 2).
    pub async fn chunk_hierarchical(
        &self,
        item_id: uuid::Uuid,
        full_text: &str,
        ctx: &ItemContext<'_>,
    ) -> Result<Vec<Chunk>, CoreError> {
        const TIERS: [u32; 4] = [2000, 800, 400, 200];

        let mut seen_raw_text = std::collections::HashSet::new();
        let mut chunks = Vec::new();

        for &ceiling in &TIERS {
            let sentences = split_sentences(full_text);
            let segments = group_by_token_ceiling(sentences, ceiling);

            for segment in segments {
                let raw_text = segment.join(" ");
                if raw_text.trim().is_empty() || !seen_raw_text.insert(raw_text.clone()) {
                    continue;
                }

                let token_count = approx_token_count(&raw_text);
                let summary = match self.summarizer.summarize(full_text, &raw_text).await {
                    Ok(s) if !s.trim().is_empty() => s,
                    _ => fallback_summary(ctx),
                };
                let quality_score = score_quality(&raw_text, token_count, self.settings);
                if quality_score < self.settings.chunk_quality_floor {
                    continue;
                }

                chunks.push(Chunk {
                    item_id,
                    index: chunks.len() as u32,
                    token_count,
                    raw_text,
                    enriched_text: format!("{summary}\n\n{}", segment.join(" ")),
                    quality_score,
                });
            }
        }

        Ok(chunks)
    }
}

fn fallback_summary(ctx: &ItemContext<'_>) -> String {
    format!("{} — {}", ctx.source, ctx.title)
}

/// Tokenizer-independent sentence boundary detector (§4.4): splits after
/// `.`/`!`/`?` when followed by whitespace and an uppercase letter, and on
/// newlines. Quote and paren cues are folded into the same scan: a
/// boundary candidate is also accepted right after a closing quote or
/// paren that itself follows terminal punctuation.
fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];

        if c == '\n' {
            push_sentence(&mut sentences, &chars[start..i]);
            start = i + 1;
            i += 1;
            continue;
        }

        if matches!(c, '.' | '!' | '?') {
            let mut j = i + 1;
            // absorb a trailing closing quote/paren right after the punctuation
            while j < chars.len() && matches!(chars[j], '"' | '\'' | ')' | '\u{201d}' | '\u{2019}')
            {
                j += 1;
            }
            if j < chars.len() && chars[j].is_whitespace() {
                let mut k = j;
                while k < chars.len() && chars[k].is_whitespace() {
                    k += 1;
                }
                let next_starts_sentence = k < chars.len()
                    && (chars[k].is_uppercase()
                        || matches!(chars[k], '"' | '\'' | '(' | '\u{201c}' | '\u{2018}'));
                if next_starts_sentence || k >= chars.len() {
                    push_sentence(&mut sentences, &chars[start..j]);
                    start = k;
                    i = k;
                    continue;
                }
            }
        }

        i += 1;
    }

    if start < chars.len() {
        push_sentence(&mut sentences, &chars[start..]);
    }

    sentences
}

fn push_sentence(out: &mut Vec<String>, chars: &[char]) {
    let s: String = chars.iter().collect::<String>().trim().to_string();
    if !s.is_empty() {
        out.push(s);
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Starts a new segment every time consecutive sentence embeddings'
/// cosine similarity drops below `threshold` (§4.4).
fn walk_similarity(
    sentences: Vec<String>,
    embeddings: &[Vec<f32>],
    threshold: f32,
) -> Vec<Vec<String>> {
    let mut segments: Vec<Vec<String>> = Vec::new();
    let mut current = Vec::new();

    for (idx, sentence) in sentences.into_iter().enumerate() {
        if idx == 0 {
            current.push(sentence);
            continue;
        }
        let sim = cosine_similarity(&embeddings[idx - 1], &embeddings[idx]);
        if sim < threshold {
            segments.push(std::mem::take(&mut current));
        }
        current.push(sentence);
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn merge_below_floor(segments: Vec<Vec<String>>, floor: u32) -> Vec<Vec<String>> {
    let mut merged: Vec<Vec<String>> = Vec::new();
    for segment in segments {
        let token_count = approx_token_count(&segment.join(" "));
        match merged.last_mut() {
            Some(prev) if token_count < floor => prev.extend(segment),
            _ => merged.push(segment),
        }
    }
    merged
}

fn cap_at_ceiling(segments: Vec<Vec<String>>, ceiling: u32) -> Vec<Vec<String>> {
    let mut capped = Vec::new();
    for segment in segments {
        let mut current = Vec::new();
        let mut current_tokens = 0u32;
        for sentence in segment {
            let tokens = approx_token_count(&sentence);
            if current_tokens + tokens > ceiling && !current.is_empty() {
                capped.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current_tokens += tokens;
            current.push(sentence);
        }
        if !current.is_empty() {
            capped.push(current);
        }
    }
    capped
}

fn group_by_token_ceiling(sentences: Vec<String>, ceiling: u32) -> Vec<Vec<String>> {
    cap_at_ceiling(vec![sentences], ceiling)
}

/// Whitespace-delimited word count, used throughout this module as a
/// tokenizer-independent stand-in for model-specific token counts (the
/// Embedder's own tokenizer is the source of truth for anything billed or
/// truncated against a model's context window).
fn approx_token_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Combines token-count proximity to the target band (40%), distinct-word
/// ratio (30%), ending on terminal punctuation (20%) and presence of
/// capitalised terms (10%) (§4.4).
fn score_quality(text: &str, token_count: u32, settings: &Settings) -> f32 {
    let target_mid = (settings.chunk_token_floor + settings.chunk_token_ceiling) as f32 / 2.0;
    let band_half_width = (settings.chunk_token_ceiling - settings.chunk_token_floor) as f32 / 2.0;
    let proximity = if band_half_width <= 0.0 {
        1.0
    } else {
        (1.0 - ((token_count as f32 - target_mid).abs() / band_half_width)).clamp(0.0, 1.0)
    };

    let words: Vec<&str> = text.split_whitespace().collect();
    let richness = if words.is_empty() {
        0.0
    } else {
        let distinct: std::collections::HashSet<String> =
            words.iter().map(|w| w.to_lowercase()).collect();
        (distinct.len() as f32 / words.len() as f32).min(1.0)
    };

    let terminal = text
        .trim_end()
        .chars()
        .next_back()
        .map(|c| matches!(c, '.' | '!' | '?' | '"' | '\''))
        .unwrap_or(false);

    let has_capitalised = words
        .iter()
        .any(|w| w.chars().next().map(|c| c.is_uppercase()).unwrap_or(false));

    0.4 * proximity
        + 0.3 * richness
        + 0.2 * if terminal { 1.0 } else { 0.0 }
        + 0.1 * if has_capitalised { 1.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FakeChatModel;
    use uuid::Uuid;

    struct HashSentenceEmbedder;

    #[async_trait]
    impl SentenceEmbedder for HashSentenceEmbedder {
        async fn embed_sentences(&self, sentences: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
            Ok(sentences
                .iter()
                .map(|s| {
                    let mut v = vec![0.0f32; 8];
                    for (i, b) in s.bytes().enumerate() {
                        v[i % 8] += b as f32;
                    }
                    v
                })
                .collect())
        }
    }

    fn ctx() -> ItemContext<'static> {
        ItemContext {
            title: "Q3 roadmap",
            author: "alice@example.test",
            source: Source::Mail,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn splits_on_terminal_punctuation_followed_by_capital() {
        let sentences = split_sentences("First sentence. Second sentence! Third one? Yes.");
        assert_eq!(sentences.len(), 4);
    }

    #[test]
    fn splits_on_newlines() {
        let sentences = split_sentences("Line one\nLine two\nLine three");
        assert_eq!(sentences.len(), 3);
    }

    #[test]
    fn does_not_split_on_abbreviation_followed_by_lowercase() {
        let sentences = split_sentences("We met at approx. five people arrived on time.");
        assert_eq!(sentences.len(), 1);
    }

    #[tokio::test]
    async fn chunking_same_text_twice_is_deterministic_in_raw_text() {
        let embedder = HashSentenceEmbedder;
        let summarizer = FakeChatModel::no_match();
        let settings = Settings::default();
        let chunker = Chunker::new(&embedder, &summarizer, &settings);
        let item_id = Uuid::new_v4();
        let text = "Alpha point one. Beta point two. Gamma point three and a few more words here to pad token count past the floor so this chunk is not merged away entirely during the run.";

        let first = chunker.chunk_contextual(item_id, text, &ctx()).await.unwrap();
        let second = chunker.chunk_contextual(item_id, text, &ctx()).await.unwrap();

        let first_raw: Vec<&str> = first.iter().map(|c| c.raw_text.as_str()).collect();
        let second_raw: Vec<&str> = second.iter().map(|c| c.raw_text.as_str()).collect();
        assert_eq!(first_raw, second_raw);
    }

    #[tokio::test]
    async fn summariser_failure_falls_back_to_source_and_title() {
        let embedder = HashSentenceEmbedder;
        let summarizer = FakeChatModel::failing();
        let settings = Settings::default();
        let chunker = Chunker::new(&embedder, &summarizer, &settings);
        let item_id = Uuid::new_v4();
        let text = "Some reasonably long piece of text that should pad past the chunk token floor threshold easily given enough repeated words words words words words words words words words.";

        let chunks = chunker.chunk_contextual(item_id, text, &ctx()).await.unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks[0].enriched_text.starts_with("mail — Q3 roadmap"));
    }

    #[tokio::test]
    async fn low_quality_chunks_are_dropped() {
        let embedder = HashSentenceEmbedder;
        let summarizer = FakeChatModel::no_match();
        let mut settings = Settings::default();
        settings.chunk_quality_floor = 0.99;
        let chunker = Chunker::new(&embedder, &summarizer, &settings);
        let chunks = chunker
            .chunk_contextual(Uuid::new_v4(), "short.", &ctx())
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn hierarchical_mode_deduplicates_identical_raw_text_across_tiers() {
        let embedder = HashSentenceEmbedder;
        let summarizer = FakeChatModel::no_match();
        let settings = Settings::default();
        let chunker = Chunker::new(&embedder, &summarizer, &settings);
        let text = "One short sentence.";

        let chunks = chunker
            .chunk_hierarchical(Uuid::new_v4(), text, &ctx())
            .await
            .unwrap();
        let raw_texts: Vec<&str> = chunks.iter().map(|c| c.raw_text.as_str()).collect();
        let unique: std::collections::HashSet<&str> = raw_texts.iter().copied().collect();
        assert_eq!(raw_texts.len(), unique.len());
    }
}
