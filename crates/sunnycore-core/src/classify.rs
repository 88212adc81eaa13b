//! Classifier (C5): decides which of a user's active Projects (if any) an
//! Item belongs to, using a Responses-API forced-tool-call pattern
//! instead of a free-form chat completion, so the result is a
//! structured decision rather than prose to parse.

use async_openai::{
    config::OpenAIConfig,
    types::responses::{
        CreateResponse, EasyInputContent, EasyInputMessage, FunctionTool, InputItem, InputParam,
        MessageType, OutputItem, Role, Tool, ToolChoiceMode, ToolChoiceOption,
    },
    Client,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::CoreError;
use crate::model::{ClassificationProfile, Project};

const CLASSIFY_TOOL_NAME: &str = "classify_item";

/// A chat-completion boundary, kept narrow on purpose: one call in, one
/// call out, no streaming or tool-use loop. `Classifier` and the
/// Chunker's contextual-summary step are both built on this.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Ask the model to pick one of `candidates` (by index) for `item_text`,
    /// or report no match. Returns `None` on model/provider failure — the
    /// caller maps that to `ItemStatus::Unclassified`, not an error, since
    /// an LLM outage must never block ingestion (§4.5, §9).
    async fn classify(
        &self,
        item_text: &str,
        candidates: &[ClassificationProfile],
    ) -> Result<Option<ClassificationOutcome>, CoreError>;

    /// Summarise `chunk_text` in the context of `item_text`, returning at
    /// most ~100 tokens of natural-language description (§4.4). Used by
    /// the Chunker; failure falls back to a caller-provided default.
    async fn summarize(&self, item_text: &str, chunk_text: &str) -> Result<String, CoreError>;
}

/// Lets an `Arc<M>` stand in for `M` at this trait boundary, so a single
/// model instance can be shared (via `App`) between the Classifier and
/// the Chunker's summariser without either one taking ownership of it.
#[async_trait]
impl<T: ChatModel + ?Sized> ChatModel for std::sync::Arc<T> {
    async fn classify(
        &self,
        item_text: &str,
        candidates: &[ClassificationProfile],
    ) -> Result<Option<ClassificationOutcome>, CoreError> {
        (**self).classify(item_text, candidates).await
    }

    async fn summarize(&self, item_text: &str, chunk_text: &str) -> Result<String, CoreError> {
        (**self).summarize(item_text, chunk_text).await
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationOutcome {
    pub project_index: usize,
    pub confidence: f32,
    /// Tags from the matched project's profile the model says it found
    /// in the item, surfaced for `ProcessingLog::detail` rather than
    /// fed back into routing (§4.5).
    pub matched_tags: Vec<String>,
    /// Tags the model inferred from the item that weren't already on
    /// the matched project's profile — candidate additions an operator
    /// can fold back into the profile by hand.
    pub inferred_tags: Vec<String>,
    /// One-sentence justification, kept short enough to log alongside
    /// the outcome without dominating it.
    pub rationale: String,
}

#[derive(Debug, Deserialize)]
struct ClassifyArgs {
    project_index: Option<usize>,
    confidence: f32,
    #[serde(default)]
    matched_tags: Vec<String>,
    #[serde(default)]
    inferred_tags: Vec<String>,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct SummarizeArgs {
    summary: String,
}

/// Production `ChatModel`, backed by an OpenAI-compatible Responses API
/// client (mirrors `OpenAIProvider::new`).
pub struct OpenAiChatModel {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(api_key: &str, model: &str) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn classify_tool() -> Tool {
        Tool::Function(FunctionTool {
            name: CLASSIFY_TOOL_NAME.to_string(),
            description: Some(
                "Select the project this item belongs to, or report no match".to_string(),
            ),
            parameters: Some(json!({
                "type": "object",
                "properties": {
                    "project_index": {
                        "type": ["integer", "null"],
                        "description": "Zero-based index into the candidate list, or null for no match"
                    },
                    "confidence": {
                        "type": "number",
                        "description": "Confidence in [0, 1]"
                    },
                    "matched_tags": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Tags from the matched project's profile found in the item"
                    },
                    "inferred_tags": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "New tags inferred from the item, not already on the profile"
                    },
                    "rationale": {
                        "type": "string",
                        "description": "One-sentence justification for the decision"
                    }
                },
                "required": ["confidence", "matched_tags", "inferred_tags", "rationale"],
                "additionalProperties": false
            })),
            strict: Some(true),
        })
    }

    fn summarize_tool() -> Tool {
        Tool::Function(FunctionTool {
            name: "summarize_chunk".to_string(),
            description: Some("Situate a text chunk within its source item".to_string()),
            parameters: Some(json!({
                "type": "object",
                "properties": {
                    "summary": {
                        "type": "string",
                        "description": "A summary of at most 100 tokens"
                    }
                },
                "required": ["summary"],
                "additionalProperties": false
            })),
            strict: Some(true),
        })
    }

    async fn call_forced(
        &self,
        instructions: String,
        user_text: String,
        tool: Tool,
        tool_name: &str,
    ) -> Result<String, CoreError> {
        let request = CreateResponse {
            model: Some(self.model.clone()),
            input: InputParam::Items(vec![InputItem::EasyMessage(EasyInputMessage {
                r#type: MessageType::Message,
                role: Role::User,
                content: EasyInputContent::Text(user_text),
            })]),
            instructions: Some(instructions),
            tools: Some(vec![tool]),
            tool_choice: Some(ToolChoiceOption::Mode(ToolChoiceMode::Required)),
            stream: Some(false),
            ..Default::default()
        };

        let response = self
            .client
            .responses()
            .create(request)
            .await
            .map_err(|e| CoreError::model(e.to_string()))?;

        response
            .output
            .into_iter()
            .find_map(|item| match item {
                OutputItem::FunctionCall(fc) if fc.name == tool_name => Some(fc.arguments),
                _ => None,
            })
            .ok_or_else(|| CoreError::model("model did not return the forced tool call"))
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn classify(
        &self,
        item_text: &str,
        candidates: &[ClassificationProfile],
    ) -> Result<Option<ClassificationOutcome>, CoreError> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let instructions = "You route ingested items to the project they best match, \
            based on each project's tags, keywords and entity patterns. If none fit, \
            return confidence 0 and no project_index."
            .to_string();

        let catalogue = candidates
            .iter()
            .enumerate()
            .map(|(i, p)| {
                format!(
                    "[{i}] tags={:?} keywords={:?} entities={:?} notes={}",
                    p.tags, p.keywords, p.entity_patterns, p.notes
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let user_text = format!("Candidates:\n{catalogue}\n\nItem:\n{item_text}");

        let raw = self
            .call_forced(instructions, user_text, Self::classify_tool(), CLASSIFY_TOOL_NAME)
            .await?;
        let args: ClassifyArgs =
            serde_json::from_str(&raw).map_err(|e| CoreError::model(e.to_string()))?;

        Ok(args.project_index.and_then(|idx| {
            if idx < candidates.len() {
                Some(ClassificationOutcome {
                    project_index: idx,
                    confidence: args.confidence,
                    matched_tags: args.matched_tags,
                    inferred_tags: args.inferred_tags,
                    rationale: args.rationale,
                })
            } else {
                None
            }
        }))
    }

    async fn summarize(&self, item_text: &str, chunk_text: &str) -> Result<String, CoreError> {
        let instructions =
            "Summarise how the following chunk fits within the whole item, in one or two \
             sentences, at most 100 tokens."
                .to_string();
        let truncated_item: String = item_text.chars().take(4000).collect();
        let user_text = format!("Full item (truncated):\n{truncated_item}\n\nChunk:\n{chunk_text}");

        let raw = self
            .call_forced(
                instructions,
                user_text,
                Self::summarize_tool(),
                "summarize_chunk",
            )
            .await?;
        let args: SummarizeArgs =
            serde_json::from_str(&raw).map_err(|e| CoreError::model(e.to_string()))?;
        Ok(args.summary)
    }
}

/// Deterministic stand-in used by every test in this crate that needs a
/// `ChatModel` but isn't testing the OpenAI wiring itself.
pub struct FakeChatModel {
    pub classify_result: Option<ClassificationOutcome>,
    pub summary: String,
    pub fail: bool,
}

impl FakeChatModel {
    pub fn no_match() -> Self {
        Self {
            classify_result: None,
            summary: String::new(),
            fail: false,
        }
    }

    pub fn matching(project_index: usize, confidence: f32) -> Self {
        Self {
            classify_result: Some(ClassificationOutcome {
                project_index,
                confidence,
                matched_tags: Vec::new(),
                inferred_tags: Vec::new(),
                rationale: "fake: matched by test fixture".to_string(),
            }),
            summary: "a relevant excerpt".to_string(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            classify_result: None,
            summary: String::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    async fn classify(
        &self,
        _item_text: &str,
        _candidates: &[ClassificationProfile],
    ) -> Result<Option<ClassificationOutcome>, CoreError> {
        if self.fail {
            return Err(CoreError::model("fake: simulated classifier outage"));
        }
        Ok(self.classify_result.clone())
    }

    async fn summarize(&self, _item_text: &str, _chunk_text: &str) -> Result<String, CoreError> {
        if self.fail {
            return Err(CoreError::model("fake: simulated summariser outage"));
        }
        Ok(self.summary.clone())
    }
}

/// Applies the confidence floor (§4.5, §9 Open Question — resolved at
/// 0.5) and reports the project id to attach, if any.
pub struct Classifier<M: ChatModel> {
    model: M,
    confidence_floor: f32,
}

impl<M: ChatModel> Classifier<M> {
    pub fn new(model: M, confidence_floor: f32) -> Self {
        Self {
            model,
            confidence_floor,
        }
    }

    /// Returns the matched `Project`, or `None` if the item should be
    /// marked `Unclassified` (no candidates, no confident match, or a
    /// classifier-side outage — outages never become `ErrorKind::Fatal`
    /// here, only a missing classification).
    pub async fn classify<'a>(
        &self,
        item_text: &str,
        candidates: &'a [Project],
    ) -> Option<&'a Project> {
        let profiles: Vec<ClassificationProfile> =
            candidates.iter().map(|p| p.profile.clone()).collect();

        let outcome = match self.model.classify(item_text, &profiles).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "classifier call failed, leaving item unclassified");
                None
            }
        };

        outcome.and_then(|o| {
            if o.confidence >= self.confidence_floor {
                let matched = candidates.get(o.project_index);
                if matched.is_some() {
                    tracing::debug!(
                        confidence = o.confidence,
                        matched_tags = ?o.matched_tags,
                        inferred_tags = ?o.inferred_tags,
                        rationale = %o.rationale,
                        "item classified"
                    );
                }
                matched
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn project(tags: &[&str]) -> Project {
        Project {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            status: crate::model::ProjectStatus::Active,
            profile: ClassificationProfile {
                tags: tags.iter().map(|s| s.to_string()).collect(),
                keywords: Vec::new(),
                entity_patterns: Vec::new(),
                notes: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn below_floor_confidence_is_unclassified() {
        let classifier = Classifier::new(FakeChatModel::matching(0, 0.3), 0.5);
        let candidates = vec![project(&["q3"])];
        assert!(classifier.classify("body", &candidates).await.is_none());
    }

    #[tokio::test]
    async fn confident_match_returns_project() {
        let classifier = Classifier::new(FakeChatModel::matching(0, 0.9), 0.5);
        let candidates = vec![project(&["q3"])];
        let matched = classifier.classify("body", &candidates).await.unwrap();
        assert_eq!(matched.id, candidates[0].id);
    }

    #[tokio::test]
    async fn no_candidates_is_unclassified() {
        let classifier = Classifier::new(FakeChatModel::no_match(), 0.5);
        assert!(classifier.classify("body", &[]).await.is_none());
    }

    #[tokio::test]
    async fn classifier_outage_is_unclassified_not_an_error() {
        let classifier = Classifier::new(FakeChatModel::failing(), 0.5);
        let candidates = vec![project(&["q3"])];
        assert!(classifier.classify("body", &candidates).await.is_none());
    }

    #[test]
    fn tool_call_args_carry_tags_and_rationale() {
        let raw = r#"{
            "project_index": 0,
            "confidence": 0.87,
            "matched_tags": ["q3", "roadmap"],
            "inferred_tags": ["budget"],
            "rationale": "mentions the Q3 roadmap review by name"
        }"#;
        let args: ClassifyArgs = serde_json::from_str(raw).unwrap();
        assert_eq!(args.project_index, Some(0));
        assert_eq!(args.matched_tags, vec!["q3", "roadmap"]);
        assert_eq!(args.inferred_tags, vec!["budget"]);
        assert_eq!(args.rationale, "mentions the Q3 roadmap review by name");
    }

    #[test]
    fn tool_call_args_default_tags_when_model_omits_them() {
        let raw = r#"{"project_index": null, "confidence": 0.0}"#;
        let args: ClassifyArgs = serde_json::from_str(raw).unwrap();
        assert!(args.matched_tags.is_empty());
        assert!(args.inferred_tags.is_empty());
        assert_eq!(args.rationale, "");
    }
}
