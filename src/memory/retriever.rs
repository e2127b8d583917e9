//! Trust-aware retrieval -- fetch, dedup, and rank memories for a
//! conversation context.
//!
//! Candidates come from the room provider (time-ordered, plus semantic
//! search when an embedding is supplied) and, when a canonical entity id
//! is present, from the entity provider's mid- and long-term tiers.
//! Duplicates are dropped by content hash across both phases, then
//! everything is ranked by a weighted blend of trust, recency, relevance,
//! and type boost. Entity-provider failures degrade to room-only results
//! and never propagate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::bus::{topics, EventBus};
use crate::kernel::event_store::sha256_hex;
use crate::memory::{EntityMemoryProvider, MemoryProvider, MemoryTier, MemoryType, TypedMemory};

/// Per-dimension ranking weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankWeights {
    /// Weight on the memory's trust score.
    pub trust: f64,
    /// Weight on recency decay.
    pub recency: f64,
    /// Weight on semantic relevance.
    pub relevance: f64,
    /// Weight on the memory-type boost.
    pub type_boost: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            trust: 0.35,
            recency: 0.25,
            relevance: 0.3,
            type_boost: 0.1,
        }
    }
}

/// Allowed band for each individual weight.
const WEIGHT_BAND: (f64, f64) = (0.05, 0.9);

/// Hard cap on returned memories.
const MAX_RESULTS_CAP: usize = 200;

/// Default result count when the caller passes zero.
const DEFAULT_MAX_RESULTS: usize = 20;

/// Characters of normalized text fed to the dedup hash head.
const DEDUP_HEAD_CHARS: usize = 200;

/// Characters of the trailing segment marker.
const DEDUP_TAIL_CHARS: usize = 32;

/// Recency half-life style constant: e-folding time in hours.
const RECENCY_DECAY_HOURS: f64 = 24.0;

/// Source category of a trust override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideSource {
    /// A human user asked for the override.
    User,
    /// An API integration asked.
    Api,
    /// A scheduled automation asked.
    Automation,
}

/// Per-request trust elevation, gated by attribution rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustOverride {
    /// Replacement trust value (clamped to [0, 1]).
    pub value: f64,
    /// Who is asking; "unknown" or empty is rejected.
    pub actor: String,
    /// What kind of caller is asking.
    pub source: OverrideSource,
    /// Independent approver, required for all sources.
    pub approved_by: Option<String>,
    /// Justification, required for user-sourced overrides.
    pub reason: Option<String>,
}

/// One retrieval request.
#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    /// Room whose memories are wanted.
    pub room_id: String,
    /// Query embedding for semantic search, when available.
    pub embedding: Option<Vec<f32>>,
    /// Canonical entity for the second fetch phase.
    pub canonical_entity_id: Option<String>,
    /// Result cap (0 means the default; clamped to 200).
    pub max_results: usize,
    /// Caller-supplied weights (sanitized against the band).
    pub weights: Option<RankWeights>,
    /// Per-type boost overrides (clamped to [0, 2]).
    pub type_boosts: Option<HashMap<MemoryType, f64>>,
    /// Trust override, audited and policy-gated.
    pub trust_override: Option<TrustOverride>,
    /// Clock for recency; defaults to now.
    pub now: Option<DateTime<Utc>>,
}

/// Score breakdown attached to each ranked memory.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RankComponents {
    /// Trust input after overrides.
    pub trust: f64,
    /// Recency decay value.
    pub recency: f64,
    /// Relevance input.
    pub relevance: f64,
    /// Type boost input.
    pub type_boost: f64,
}

/// One memory with its composite score.
#[derive(Debug, Clone)]
pub struct RankedMemory {
    /// The memory.
    pub memory: TypedMemory,
    /// Composite ranking score.
    pub score: f64,
    /// Per-dimension inputs.
    pub components: RankComponents,
}

/// Default boost for a memory type.
fn default_type_boost(memory_type: Option<MemoryType>) -> f64 {
    match memory_type {
        Some(MemoryType::Instruction | MemoryType::System) => 1.0,
        Some(MemoryType::Fact) => 0.9,
        Some(MemoryType::Goal) => 0.85,
        Some(MemoryType::Preference) => 0.8,
        Some(MemoryType::Action) => 0.7,
        Some(MemoryType::Observation) => 0.6,
        None => 0.5,
    }
}

/// Dedup hash over type plus whitespace-normalized text.
///
/// Texts longer than the head window contribute their head, a trailing
/// segment, and the total length, so long texts differing only past the
/// boundary still hash apart. Memories without text return `None` and
/// always pass through dedup.
pub fn content_hash(memory: &TypedMemory) -> Option<String> {
    let text = memory.content.text.as_deref()?;
    let normalized: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let type_name = memory
        .metadata
        .memory_type
        .map_or("untyped", MemoryType::as_str);

    let char_count = normalized.chars().count();
    let key = if char_count > DEDUP_HEAD_CHARS {
        let head: String = normalized.chars().take(DEDUP_HEAD_CHARS).collect();
        let tail: String = normalized
            .chars()
            .skip(char_count.saturating_sub(DEDUP_TAIL_CHARS))
            .collect();
        format!("{head}#{tail}#{char_count}")
    } else {
        normalized
    };

    Some(sha256_hex(format!("{type_name}|{key}").as_bytes()))
}

/// Retriever over room and entity memory providers.
pub struct TrustAwareRetriever {
    rooms: Arc<dyn MemoryProvider>,
    entities: Option<Arc<dyn EntityMemoryProvider>>,
    bus: Arc<dyn EventBus>,
    fetch_limit: usize,
}

impl std::fmt::Debug for TrustAwareRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustAwareRetriever")
            .field("has_entity_provider", &self.entities.is_some())
            .finish()
    }
}

impl TrustAwareRetriever {
    /// Create a room-only retriever.
    pub fn new(rooms: Arc<dyn MemoryProvider>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            rooms,
            entities: None,
            bus,
            fetch_limit: 100,
        }
    }

    /// Attach an entity provider for the second fetch phase.
    #[must_use]
    pub fn with_entity_provider(mut self, entities: Arc<dyn EntityMemoryProvider>) -> Self {
        self.entities = Some(entities);
        self
    }

    /// Fetch, dedup, and rank memories for a request.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> Vec<RankedMemory> {
        let weights = self.sanitized_weights(request);
        let max_results = match request.max_results {
            0 => DEFAULT_MAX_RESULTS,
            n => n.min(MAX_RESULTS_CAP),
        };
        let now = request.now.unwrap_or_else(Utc::now);

        let mut candidates = self.fetch_room(request).await;
        candidates.extend(self.fetch_entity(request).await);

        // Cross-phase dedup by content hash; first occurrence wins.
        let mut seen: HashSet<String> = HashSet::new();
        let mut unique: Vec<TypedMemory> = Vec::with_capacity(candidates.len());
        for memory in candidates {
            match content_hash(&memory) {
                Some(hash) => {
                    if seen.insert(hash) {
                        unique.push(memory);
                    }
                }
                None => unique.push(memory),
            }
        }

        let trust_override = request
            .trust_override
            .as_ref()
            .and_then(|o| self.validate_override(o));

        let mut ranked: Vec<RankedMemory> = unique
            .into_iter()
            .map(|memory| self.rank(memory, &weights, request, trust_override, now))
            .collect();

        // Stable order under equal scores keeps retrieval idempotent.
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.memory.id.cmp(&b.memory.id))
        });
        ranked.truncate(max_results);
        debug!(
            room_id = %request.room_id,
            returned = ranked.len(),
            "retrieval ranked"
        );
        ranked
    }

    fn sanitized_weights(&self, request: &RetrievalRequest) -> RankWeights {
        let Some(weights) = request.weights else {
            return RankWeights::default();
        };
        let (lo, hi) = WEIGHT_BAND;
        let out_of_band = [
            weights.trust,
            weights.recency,
            weights.relevance,
            weights.type_boost,
        ]
        .iter()
        .any(|w| *w < lo || *w > hi);

        if out_of_band {
            warn!(?weights, "rank weights outside band, reverting to defaults");
            self.bus.emit(
                topics::RETRIEVAL_RANK_GUARDRAIL,
                json!({
                    "roomId": request.room_id,
                    "suppliedWeights": weights,
                    "action": "reverted-to-defaults",
                }),
            );
            RankWeights::default()
        } else {
            weights
        }
    }

    async fn fetch_room(&self, request: &RetrievalRequest) -> Vec<TypedMemory> {
        let mut memories = match self.rooms.recent(&request.room_id, self.fetch_limit).await {
            Ok(memories) => memories,
            Err(e) => {
                warn!(room_id = %request.room_id, error = %e, "room recency fetch failed");
                Vec::new()
            }
        };

        if let Some(embedding) = &request.embedding {
            match self
                .rooms
                .semantic(&request.room_id, embedding, self.fetch_limit)
                .await
            {
                Ok(semantic) => memories.extend(semantic),
                Err(e) => {
                    warn!(room_id = %request.room_id, error = %e, "room semantic fetch failed");
                }
            }
        }
        memories
    }

    async fn fetch_entity(&self, request: &RetrievalRequest) -> Vec<TypedMemory> {
        let (Some(entities), Some(entity_id)) =
            (self.entities.as_ref(), request.canonical_entity_id.as_ref())
        else {
            return Vec::new();
        };

        if let Some(embedding) = &request.embedding {
            match entities
                .semantic(entity_id, embedding, self.fetch_limit)
                .await
            {
                Ok(memories) => return memories,
                Err(e) => {
                    warn!(
                        entity_id = %entity_id,
                        error = %e,
                        "entity semantic fetch failed, falling back to tiers"
                    );
                }
            }
        }

        let mut memories = Vec::new();
        for tier in [MemoryTier::MidTerm, MemoryTier::LongTerm] {
            match entities.tier(entity_id, tier, self.fetch_limit).await {
                Ok(batch) => memories.extend(batch),
                Err(e) => {
                    warn!(
                        entity_id = %entity_id,
                        ?tier,
                        error = %e,
                        "entity tier fetch failed, continuing without it"
                    );
                }
            }
        }
        memories
    }

    /// Apply the override policy; emits exactly one audit event per
    /// attempt. Returns the clamped value when applied.
    fn validate_override(&self, requested: &TrustOverride) -> Option<f64> {
        let rejection = if requested.actor.trim().is_empty() || requested.actor == "unknown" {
            Some("actor is unknown")
        } else {
            match requested.source {
                OverrideSource::User => {
                    if requested
                        .approved_by
                        .as_deref()
                        .is_none_or(|s| s.trim().is_empty())
                    {
                        Some("user-sourced override requires an approver")
                    } else if requested.reason.as_deref().is_none_or(|s| s.trim().is_empty()) {
                        Some("user-sourced override requires a reason")
                    } else {
                        None
                    }
                }
                OverrideSource::Api | OverrideSource::Automation => {
                    if requested
                        .approved_by
                        .as_deref()
                        .is_none_or(|s| s.trim().is_empty())
                    {
                        Some("api/automation override requires an approver")
                    } else {
                        None
                    }
                }
            }
        };

        match rejection {
            Some(reason) => {
                warn!(actor = %requested.actor, reason, "trust override rejected");
                self.bus.emit(
                    topics::RETRIEVAL_TRUST_OVERRIDE,
                    json!({
                        "decision": "rejected",
                        "actor": requested.actor,
                        "reason": reason,
                    }),
                );
                None
            }
            None => {
                let value = requested.value.clamp(0.0, 1.0);
                self.bus.emit(
                    topics::RETRIEVAL_TRUST_OVERRIDE,
                    json!({
                        "decision": "applied",
                        "actor": requested.actor,
                        "value": value,
                        "approvedBy": requested.approved_by,
                    }),
                );
                Some(value)
            }
        }
    }

    fn rank(
        &self,
        memory: TypedMemory,
        weights: &RankWeights,
        request: &RetrievalRequest,
        trust_override: Option<f64>,
        now: DateTime<Utc>,
    ) -> RankedMemory {
        let trust = trust_override
            .or(memory.metadata.trust_score)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let recency = recency_score(memory.created_at, now);
        let relevance = memory.metadata.similarity.unwrap_or(0.5).clamp(0.0, 1.0);
        let type_boost = request
            .type_boosts
            .as_ref()
            .and_then(|boosts| {
                memory
                    .metadata
                    .memory_type
                    .and_then(|t| boosts.get(&t).copied())
            })
            .map_or_else(
                || default_type_boost(memory.metadata.memory_type),
                |b| b.clamp(0.0, 2.0),
            );

        let score = weights.trust * trust
            + weights.recency * recency
            + weights.relevance * relevance
            + weights.type_boost * type_boost;

        RankedMemory {
            memory,
            score,
            components: RankComponents {
                trust,
                recency,
                relevance,
                type_boost,
            },
        }
    }
}

/// Exponential recency decay: 1.0 at zero age, ~0.5 at 24h, ~0.25 at 48h.
/// Memories without a creation time score a neutral 0.5.
fn recency_score(created_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(created) = created_at else {
        return 0.5;
    };
    let age = now.signed_duration_since(created);
    if age < chrono::TimeDelta::zero() {
        return 1.0;
    }
    #[allow(clippy::cast_precision_loss)] // ages far beyond f64 precision are decades out
    let age_hours = age.num_seconds() as f64 / 3_600.0;
    (-age_hours / RECENCY_DECAY_HOURS).exp()
}
