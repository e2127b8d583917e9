//! Memory subsystem -- trust scoring, the write gate, and trust-aware
//! retrieval.
//!
//! Inbound content is scored ([`trust`]) and routed by the gate
//! ([`gate`]) before anything reaches a memory store; retrieval
//! ([`retriever`]) re-ranks stored memories by trust, recency, relevance,
//! and type. The stores themselves live behind the provider traits
//! below -- the kernel does not prescribe a persistence engine.

pub mod gate;
pub mod retriever;
pub mod trust;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a stored memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// Verifiable statement about the world.
    Fact,
    /// Standing instruction to the agent.
    Instruction,
    /// User preference.
    Preference,
    /// Something the agent noticed.
    Observation,
    /// Active goal.
    Goal,
    /// Runtime-internal note.
    System,
    /// Record of an action taken.
    Action,
}

impl MemoryType {
    /// Stable lowercase name (used in dedup hashes).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Instruction => "instruction",
            Self::Preference => "preference",
            Self::Observation => "observation",
            Self::Goal => "goal",
            Self::System => "system",
            Self::Action => "action",
        }
    }
}

/// Where a memory came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    /// Source identifier (user id, feed name, ...).
    #[serde(default)]
    pub source: Option<String>,
    /// Source category ("user", "api", "automation", ...).
    #[serde(default)]
    pub source_type: Option<String>,
    /// Action that created the memory.
    #[serde(default)]
    pub action: Option<String>,
    /// When the memory was written.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Trust score at write time.
    #[serde(default)]
    pub trust_score_at_write: Option<f64>,
}

/// Metadata attached to a stored memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMetadata {
    /// Trust score assigned at write or review time.
    #[serde(default)]
    pub trust_score: Option<f64>,
    /// Memory classification.
    #[serde(default)]
    pub memory_type: Option<MemoryType>,
    /// Semantic similarity to the query, set by the search provider.
    #[serde(default)]
    pub similarity: Option<f64>,
    /// Origin record.
    #[serde(default)]
    pub provenance: Provenance,
    /// Whether a human or checker verified the content.
    #[serde(default)]
    pub verified: bool,
}

/// Textual memory content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryContent {
    /// The memory text; `None` for non-textual payloads.
    #[serde(default)]
    pub text: Option<String>,
}

/// One stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypedMemory {
    /// Unique memory id.
    pub id: String,
    /// Conversation room the memory belongs to.
    pub room_id: String,
    /// Canonical entity the memory is about, when known.
    #[serde(default)]
    pub entity_id: Option<String>,
    /// The content itself.
    pub content: MemoryContent,
    /// When the memory was created; `None` for legacy rows.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Attached metadata.
    #[serde(default)]
    pub metadata: MemoryMetadata,
}

impl TypedMemory {
    /// Minimal textual memory for wiring and tests.
    pub fn text(
        id: impl Into<String>,
        room_id: impl Into<String>,
        text: impl Into<String>,
        memory_type: MemoryType,
    ) -> Self {
        Self {
            id: id.into(),
            room_id: room_id.into(),
            entity_id: None,
            content: MemoryContent {
                text: Some(text.into()),
            },
            created_at: Some(Utc::now()),
            metadata: MemoryMetadata {
                memory_type: Some(memory_type),
                ..MemoryMetadata::default()
            },
        }
    }
}

/// Entity-scoped memory tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Recent entity context.
    MidTerm,
    /// Durable entity knowledge.
    LongTerm,
}

/// Provider failures. Retrieval treats these as degradation, not errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backing store failed.
    #[error("memory provider failure: {0}")]
    Backend(String),
    /// The provider does not support the requested operation.
    #[error("memory provider does not support {0}")]
    Unsupported(&'static str),
}

/// Room-scoped memory source.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    /// Most recent memories for a room, newest first.
    async fn recent(&self, room_id: &str, limit: usize) -> Result<Vec<TypedMemory>, ProviderError>;

    /// Semantically closest memories for a room given a query embedding.
    async fn semantic(
        &self,
        room_id: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<TypedMemory>, ProviderError>;
}

/// Entity-scoped memory source (mid- and long-term tiers).
#[async_trait]
pub trait EntityMemoryProvider: Send + Sync {
    /// Time-ordered memories for an entity in one tier.
    async fn tier(
        &self,
        entity_id: &str,
        tier: MemoryTier,
        limit: usize,
    ) -> Result<Vec<TypedMemory>, ProviderError>;

    /// Semantically closest memories for an entity given an embedding.
    async fn semantic(
        &self,
        entity_id: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<TypedMemory>, ProviderError>;
}
