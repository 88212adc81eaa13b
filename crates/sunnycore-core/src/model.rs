//! Durable entity types shared by every component (§3).
//!
//! These are plain data types; persistence lives in `store`, vector
//! metadata lives in `search`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three content sources the system ingests from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Mail,
    Drive,
    Calendar,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Mail => "mail",
            Source::Drive => "drive",
            Source::Calendar => "calendar",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub primary_mail_address: String,
    pub active: bool,
    /// Per-source credential connectivity; the Pipeline and Scheduler
    /// consult this instead of doing OAuth themselves (out of scope, §1).
    pub source_credentials_connected: HashMap<Source, bool>,
}

impl User {
    /// The recognised virtual mail address `ai+<username>@<domain>`.
    pub fn virtual_mail_address(&self, domain: &str) -> String {
        format!("ai+{}@{}", self.username, domain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    InProgress,
    Archived,
}

/// The subset of a Project fed to the Classifier (§4.5, GLOSSARY).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationProfile {
    pub tags: Vec<String>,
    pub keywords: Vec<String>,
    pub entity_patterns: Vec<String>,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: ProjectStatus,
    pub profile: ClassificationProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Classified,
    Unclassified,
    Embedded,
    Deleted,
    Failed,
}

/// Source-specific metadata carried on an Item (§3, §9 "dynamic content
/// dictionaries" design note). Kept as a typed enum at the adapter
/// boundary rather than an open map, so mismatched-source metadata is a
/// compile error instead of a runtime key-lookup miss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ItemMetadata {
    Mail {
        headers: HashMap<String, String>,
        attachments: Vec<String>,
    },
    Drive {
        mime_type: String,
        size_bytes: u64,
        revision: String,
    },
    Calendar {
        attendees: Vec<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl ItemMetadata {
    pub fn source(&self) -> Source {
        match self {
            ItemMetadata::Mail { .. } => Source::Mail,
            ItemMetadata::Drive { .. } => Source::Drive,
            ItemMetadata::Calendar { .. } => Source::Calendar,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub source: Source,
    /// Provider-native id; `(source, source_id)` is the uniqueness key.
    pub source_id: String,
    pub owner_id: Uuid,
    pub project_id: Option<Uuid>,
    pub title: String,
    pub author: String,
    pub received_at: DateTime<Utc>,
    pub body: String,
    pub metadata: ItemMetadata,
    pub status: ItemStatus,
    /// Provider revision/history marker used to detect no-op re-ingestion
    /// (step 1 of the Pipeline, §4.7).
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watch {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub source: Source,
    pub resource_id: Option<String>,
    pub channel_handle: String,
    pub expiry: DateTime<Utc>,
    pub active: bool,
    /// Consecutive failed renewal attempts (§4.11 three-strikes rule).
    pub renewal_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub owner_id: Uuid,
    pub source: Source,
    pub history_token: Option<String>,
    pub last_successful_poll: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeFrequency {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityMetric {
    pub owner_id: Uuid,
    pub source: Source,
    pub items_seen_total: u64,
    pub items_changed_last_24h: u64,
    pub change_frequency: ChangeFrequency,
    pub next_interval_minutes: u32,
    /// Folded into the Scheduler's interval formula (§4.10); surfaced
    /// here as a first-class field so it's directly observable in tests.
    pub virtual_mail_activity_24h: bool,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl ActivityMetric {
    pub fn new(owner_id: Uuid, source: Source) -> Self {
        Self {
            owner_id,
            source,
            items_seen_total: 0,
            items_changed_last_24h: 0,
            change_frequency: ChangeFrequency::Low,
            next_interval_minutes: 30,
            virtual_mail_activity_24h: false,
            last_activity_at: None,
        }
    }

    /// Fourteen days with zero activity suspends the user's polling for
    /// this source until a push callback or explicit resume (§4.10).
    pub fn is_inactive(&self, now: DateTime<Utc>) -> bool {
        match self.last_activity_at {
            Some(t) => now - t > chrono::Duration::days(14),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub item_id: Uuid,
    pub index: u32,
    pub token_count: u32,
    pub raw_text: String,
    pub enriched_text: String,
    pub quality_score: f32,
}

impl Chunk {
    /// Embedding id scheme from §3/§4.6: `<item_id>:<chunk_index>`.
    pub fn vector_id(&self) -> String {
        format!("{}:{}", self.item_id, self.index)
    }
}

/// Metadata carried on every Embedding (§3). The vector itself lives only
/// in the Vector Index; this struct is what gets upserted alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    pub user_id: Uuid,
    pub project_id: Option<Uuid>,
    pub source: Source,
    pub item_id: Uuid,
    pub chunk_index: u32,
    pub enriched_text: String,
    pub title: String,
    pub author: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Duplicate,
    Updated,
    Deleted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Fatal,
    Auth,
    Invariant,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLog {
    pub id: Uuid,
    pub item_id: Uuid,
    pub owner_id: Uuid,
    pub outcome: Outcome,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}
