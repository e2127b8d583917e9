//! Memory gate -- allow / quarantine / reject routing for inbound
//! content.
//!
//! Content is scored by the [`TrustScorer`] and routed by threshold
//! bands: at or above the write threshold it is allowed, between the
//! thresholds it waits in a bounded quarantine for human review, below
//! the quarantine threshold it is rejected outright. The quarantine is
//! insertion-ordered with LRU eviction; every decision is emitted on the
//! bus and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{topics, EventBus};
use crate::memory::trust::{InboundContent, TrustScorer};
use crate::metrics::KernelMetrics;
use crate::types::TrustScore;

/// Gate thresholds and quarantine sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryGateConfig {
    /// Score at or above this writes straight through.
    pub write_threshold: f64,
    /// Score at or above this (but below write) goes to quarantine.
    pub quarantine_threshold: f64,
    /// Maximum quarantined items before LRU eviction.
    pub max_quarantine_size: usize,
    /// Suggested review delay handed back with quarantine decisions.
    pub review_after_ms: u64,
}

impl Default for MemoryGateConfig {
    fn default() -> Self {
        Self {
            write_threshold: 0.7,
            quarantine_threshold: 0.3,
            max_quarantine_size: 1_000,
            review_after_ms: 3_600_000,
        }
    }
}

/// Routing decision for one piece of content.
#[derive(Debug, Clone)]
pub enum GateDecision {
    /// Write the content through.
    Allow {
        /// The computed score (sentinel -1 when the gate is disabled).
        trust: TrustScore,
    },
    /// Hold the content for human review.
    Quarantine {
        /// Quarantine item id, for later review calls.
        id: Uuid,
        /// Suggested review delay.
        review_after_ms: u64,
        /// The computed score.
        trust: TrustScore,
    },
    /// Drop the content.
    Reject {
        /// The computed score.
        trust: TrustScore,
        /// Why it was rejected.
        reason: String,
    },
}

impl GateDecision {
    /// Decision label used in events and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow { .. } => "allow",
            Self::Quarantine { .. } => "quarantine",
            Self::Reject { .. } => "reject",
        }
    }
}

/// One item waiting for review.
#[derive(Debug, Clone)]
pub struct QuarantinedItem {
    /// Item id.
    pub id: Uuid,
    /// The held content.
    pub content: InboundContent,
    /// Score at gate time.
    pub trust: TrustScore,
    /// When the item entered quarantine.
    pub quarantined_at: DateTime<Utc>,
}

/// Running counters for gate activity.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GateStats {
    /// Contents allowed through.
    pub allowed: u64,
    /// Contents quarantined.
    pub quarantined: u64,
    /// Contents rejected.
    pub rejected: u64,
    /// Items currently awaiting review.
    pub pending_review: usize,
}

/// Reviewer verdict for a quarantined item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    /// Promote the item to a write.
    Approve,
    /// Drop the item.
    Reject,
}

/// Trust-gated admission control for the memory store.
pub struct MemoryGate {
    scorer: Arc<TrustScorer>,
    config: MemoryGateConfig,
    quarantine: Mutex<VecDeque<QuarantinedItem>>,
    allowed: AtomicU64,
    quarantined: AtomicU64,
    rejected: AtomicU64,
    bus: Arc<dyn EventBus>,
    metrics: Arc<KernelMetrics>,
    enabled: bool,
}

impl std::fmt::Debug for MemoryGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGate")
            .field("enabled", &self.enabled)
            .field("config", &self.config)
            .finish()
    }
}

impl MemoryGate {
    /// Create an enabled gate.
    pub fn new(
        scorer: Arc<TrustScorer>,
        config: MemoryGateConfig,
        bus: Arc<dyn EventBus>,
        metrics: Arc<KernelMetrics>,
    ) -> Self {
        Self {
            scorer,
            config,
            quarantine: Mutex::new(VecDeque::new()),
            allowed: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            bus,
            metrics,
            enabled: true,
        }
    }

    /// Create a disabled gate: everything is allowed with the sentinel
    /// score and nothing is quarantined.
    pub fn disabled(bus: Arc<dyn EventBus>, metrics: Arc<KernelMetrics>) -> Self {
        let mut gate = Self::new(
            Arc::new(TrustScorer::default()),
            MemoryGateConfig::default(),
            bus,
            metrics,
        );
        gate.enabled = false;
        gate
    }

    fn lock_quarantine(&self) -> std::sync::MutexGuard<'_, VecDeque<QuarantinedItem>> {
        self.quarantine
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Score content and route it.
    pub async fn admit(&self, content: InboundContent) -> GateDecision {
        if !self.enabled {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return GateDecision::Allow {
                trust: TrustScore::sentinel(),
            };
        }

        let trust = self.scorer.score(&content).await;
        let decision = if trust.score >= self.config.write_threshold {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            GateDecision::Allow { trust }
        } else if trust.score >= self.config.quarantine_threshold {
            let id = self.push_quarantine(content, trust.clone());
            self.quarantined.fetch_add(1, Ordering::Relaxed);
            GateDecision::Quarantine {
                id,
                review_after_ms: self.config.review_after_ms,
                trust,
            }
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            let reason = format!(
                "score {:.2} below quarantine threshold {:.2}",
                trust.score, self.config.quarantine_threshold
            );
            GateDecision::Reject { trust, reason }
        };

        let accepted = !matches!(decision, GateDecision::Reject { .. });
        self.metrics.record_gate_decision(accepted);
        self.metrics
            .set_quarantine_size(u64::try_from(self.lock_quarantine().len()).unwrap_or(u64::MAX));
        self.bus.emit(
            topics::MEMORY_GATE_DECISION,
            json!({
                "decision": decision.label(),
                "score": match &decision {
                    GateDecision::Allow { trust }
                    | GateDecision::Quarantine { trust, .. }
                    | GateDecision::Reject { trust, .. } => trust.score,
                },
            }),
        );
        debug!(decision = decision.label(), "memory gate decision");
        decision
    }

    fn push_quarantine(&self, content: InboundContent, trust: TrustScore) -> Uuid {
        let id = Uuid::new_v4();
        let mut quarantine = self.lock_quarantine();
        if quarantine.len() >= self.config.max_quarantine_size {
            if let Some(evicted) = quarantine.pop_front() {
                info!(evicted_id = %evicted.id, "quarantine full, evicting oldest item");
            }
        }
        quarantine.push_back(QuarantinedItem {
            id,
            content,
            trust,
            quarantined_at: Utc::now(),
        });
        id
    }

    /// Review one quarantined item; removes it either way.
    ///
    /// Approvals feed positive reliability back to the source, rejections
    /// negative. Returns the removed item, or `None` for unknown ids.
    pub fn review(&self, id: Uuid, verdict: ReviewVerdict) -> Option<QuarantinedItem> {
        let item = {
            let mut quarantine = self.lock_quarantine();
            let index = quarantine.iter().position(|i| i.id == id)?;
            quarantine.remove(index)
        }?;

        self.scorer.record_feedback(
            &item.content.source_id,
            verdict == ReviewVerdict::Approve,
        );
        info!(
            item_id = %id,
            verdict = ?verdict,
            source = %item.content.source_id,
            "quarantined item reviewed"
        );
        self.metrics
            .set_quarantine_size(u64::try_from(self.lock_quarantine().len()).unwrap_or(u64::MAX));
        Some(item)
    }

    /// Items currently awaiting review, oldest first.
    pub fn pending_review(&self) -> Vec<QuarantinedItem> {
        self.lock_quarantine().iter().cloned().collect()
    }

    /// Current gate counters.
    pub fn stats(&self) -> GateStats {
        GateStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            pending_review: self.lock_quarantine().len(),
        }
    }
}
