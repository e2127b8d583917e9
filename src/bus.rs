//! Event bus boundary -- kernel-produced notifications for observers.
//!
//! The kernel never holds a transport; it emits `(topic, payload)` pairs
//! through the [`EventBus`] trait and the embedding application decides
//! where they go (IPC, websockets, logs). [`TracingBus`] is the default
//! sink; [`RecordingBus`] captures emissions for tests.

use std::sync::Mutex;

use tracing::info;

/// Topics the kernel publishes.
pub mod topics {
    /// A pipeline run began.
    pub const PIPELINE_STARTED: &str = "autonomy:pipeline:started";
    /// A pipeline run returned (success or failure).
    pub const PIPELINE_COMPLETED: &str = "autonomy:pipeline:completed";
    /// An approval request was created.
    pub const APPROVAL_REQUESTED: &str = "autonomy:approval:requested";
    /// An approval request was resolved.
    pub const APPROVAL_RESOLVED: &str = "autonomy:approval:resolved";
    /// Post-condition checks ran for a tool result.
    pub const POSTCONDITION_CHECKED: &str = "autonomy:tool:postcondition:checked";
    /// Cross-system invariants were evaluated.
    pub const INVARIANTS_CHECKED: &str = "autonomy:invariants:checked";
    /// A compensation action was attempted.
    pub const COMPENSATION_ATTEMPTED: &str = "autonomy:compensation:attempted";
    /// A compensation incident was opened for operators.
    pub const COMPENSATION_INCIDENT_OPENED: &str = "autonomy:compensation:incident:opened";
    /// A tool was blocked because the kernel is in safe mode.
    pub const SAFE_MODE_TOOL_BLOCKED: &str = "autonomy:safe-mode:tool-blocked";
    /// Terminal decision summary for a run.
    pub const DECISION_LOGGED: &str = "autonomy:decision:logged";
    /// A retrieval trust override was applied or rejected.
    pub const RETRIEVAL_TRUST_OVERRIDE: &str = "autonomy:retrieval:trust-override";
    /// Retrieval ranking weights were sanitized back to defaults.
    pub const RETRIEVAL_RANK_GUARDRAIL: &str = "autonomy:retrieval:rank-guardrail";
    /// The memory gate admitted, quarantined, or rejected content.
    pub const MEMORY_GATE_DECISION: &str = "memory-gate:decision";
}

/// Outbound notification sink consumed by the kernel.
///
/// Implementations must be cheap and non-blocking; the kernel calls
/// `emit` inline on its hot path.
pub trait EventBus: Send + Sync {
    /// Publish one payload under a topic. Must not panic.
    fn emit(&self, topic: &str, payload: serde_json::Value);
}

/// Default bus: forwards every emission to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBus;

impl EventBus for TracingBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        info!(topic, payload = %payload, "bus event");
    }
}

/// Bus that drops everything. Useful for benchmarks and minimal wiring.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBus;

impl EventBus for NullBus {
    fn emit(&self, _topic: &str, _payload: serde_json::Value) {}
}

/// Bus that records emissions in memory for assertions.
#[derive(Debug, Default)]
pub struct RecordingBus {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingBus {
    /// Create an empty recording bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all `(topic, payload)` pairs emitted so far.
    pub fn emitted(&self) -> Vec<(String, serde_json::Value)> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Payloads emitted under one topic.
    pub fn topic(&self, topic: &str) -> Vec<serde_json::Value> {
        self.emitted()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p)
            .collect()
    }
}

impl EventBus for RecordingBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((topic.to_owned(), payload));
    }
}
