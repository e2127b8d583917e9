//! Approval gate -- human-in-the-loop decisions for high-risk calls.
//!
//! The pipeline submits a request and receives a `tokio::sync::oneshot`
//! receiver to await the decision; a per-request timer resolves the
//! request as `expired` when nobody answers within the TTL. Resolution is
//! at-most-once: the first decision wins and later attempts report
//! failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{topics, EventBus};
use crate::types::{ApprovalDecision, ApprovalRequest, ProposedToolCall, RiskClass};

/// Default approval timeout: five minutes.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// A resolved approval, delivered through the oneshot channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalOutcome {
    /// The decision.
    pub decision: ApprovalDecision,
    /// Who decided, when known (`None` for timer expiry).
    pub decided_by: Option<String>,
}

/// A pending request handed back to the pipeline.
pub struct PendingApproval {
    /// Request ID, for out-of-band resolution.
    pub id: Uuid,
    /// Receiver yielding the decision once resolved.
    pub receiver: oneshot::Receiver<ApprovalOutcome>,
}

impl std::fmt::Debug for PendingApproval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingApproval")
            .field("id", &self.id)
            .finish()
    }
}

/// The approval surface the pipeline depends on.
///
/// Both the in-memory [`ApprovalGate`] and the persistent variant
/// implement this, so the orchestrator never knows which one it holds.
#[async_trait]
pub trait ApprovalRouting: Send + Sync {
    /// Submit a call for approval; the returned receiver suspends the
    /// caller until a decision or expiry arrives.
    async fn request_approval(&self, call: &ProposedToolCall, risk: RiskClass) -> PendingApproval;

    /// Number of requests currently awaiting a decision.
    fn pending_count(&self) -> usize;
}

struct PendingEntry {
    request: ApprovalRequest,
    sender: oneshot::Sender<ApprovalOutcome>,
    timer: JoinHandle<()>,
}

impl std::fmt::Debug for PendingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEntry")
            .field("request", &self.request)
            .finish()
    }
}

/// In-memory approval gate with per-request expiry timers.
pub struct ApprovalGate {
    pending: Arc<Mutex<HashMap<Uuid, PendingEntry>>>,
    timeout: Duration,
    bus: Arc<dyn EventBus>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("pending", &self.pending_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn lock_pending(
    pending: &Mutex<HashMap<Uuid, PendingEntry>>,
) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingEntry>> {
    pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl ApprovalGate {
    /// Create a gate with an explicit timeout.
    pub fn new(timeout: Duration, bus: Arc<dyn EventBus>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            bus,
        }
    }

    /// Create a gate with the default five-minute timeout.
    pub fn with_default_timeout(bus: Arc<dyn EventBus>) -> Self {
        Self::new(DEFAULT_APPROVAL_TIMEOUT, bus)
    }

    /// Submit a request and arm its expiry timer.
    pub fn submit(&self, call: &ProposedToolCall, risk: RiskClass) -> PendingApproval {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let ttl = TimeDelta::from_std(self.timeout).unwrap_or_else(|_| TimeDelta::seconds(300));
        let request = ApprovalRequest {
            id,
            call: call.clone(),
            risk_class: risk,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(now),
        };
        self.insert_pending(request)
    }

    /// Insert a pre-built request (used by hydration) and arm a timer for
    /// its remaining TTL.
    pub(crate) fn insert_pending(&self, request: ApprovalRequest) -> PendingApproval {
        let id = request.id;
        let (tx, rx) = oneshot::channel();

        let remaining = request
            .expires_at
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        info!(
            approval_id = %id,
            tool = %request.call.tool,
            risk = %request.risk_class,
            remaining_secs = remaining.as_secs(),
            "approval request pending"
        );

        let pending = Arc::clone(&self.pending);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            if let Some(entry) = lock_pending(&pending).remove(&id) {
                warn!(approval_id = %id, tool = %entry.request.call.tool, "approval expired");
                let _send = entry.sender.send(ApprovalOutcome {
                    decision: ApprovalDecision::Expired,
                    decided_by: None,
                });
            }
        });

        lock_pending(&self.pending).insert(
            id,
            PendingEntry {
                request,
                sender: tx,
                timer,
            },
        );

        PendingApproval { id, receiver: rx }
    }

    /// Resolve a pending request. Returns false when the id is unknown
    /// (already resolved, expired, or never submitted).
    pub fn resolve(&self, id: Uuid, decision: ApprovalDecision, decided_by: Option<&str>) -> bool {
        let Some(entry) = lock_pending(&self.pending).remove(&id) else {
            return false;
        };
        entry.timer.abort();

        info!(
            approval_id = %id,
            tool = %entry.request.call.tool,
            decision = %decision,
            decided_by = decided_by.unwrap_or("-"),
            "approval resolved"
        );
        self.bus.emit(
            topics::APPROVAL_RESOLVED,
            json!({
                "approvalId": id.to_string(),
                "tool": entry.request.call.tool,
                "decision": decision.to_string(),
                "decidedBy": decided_by,
            }),
        );

        // Receiver may be gone if the pipeline was cancelled; ignore.
        let _send = entry.sender.send(ApprovalOutcome {
            decision,
            decided_by: decided_by.map(str::to_owned),
        });
        true
    }

    /// All requests currently pending.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        lock_pending(&self.pending)
            .values()
            .map(|e| e.request.clone())
            .collect()
    }

    /// One pending request by id.
    pub fn pending_by_id(&self, id: Uuid) -> Option<ApprovalRequest> {
        lock_pending(&self.pending)
            .get(&id)
            .map(|e| e.request.clone())
    }

    /// Drop every pending request and cancel its timer.
    ///
    /// Waiting pipelines observe a closed channel, which they treat as
    /// an expiry.
    pub fn dispose(&self) {
        let drained: Vec<PendingEntry> = lock_pending(&self.pending)
            .drain()
            .map(|(_, e)| e)
            .collect();
        for entry in &drained {
            entry.timer.abort();
        }
        if !drained.is_empty() {
            warn!(
                count = drained.len(),
                "approval gate disposed with pending requests"
            );
        }
    }
}

#[async_trait]
impl ApprovalRouting for ApprovalGate {
    async fn request_approval(&self, call: &ProposedToolCall, risk: RiskClass) -> PendingApproval {
        let pending = self.submit(call, risk);
        self.bus.emit(
            topics::APPROVAL_REQUESTED,
            json!({
                "approvalId": pending.id.to_string(),
                "tool": call.tool,
                "requestId": call.request_id,
                "risk": risk.to_string(),
            }),
        );
        pending
    }

    fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}
