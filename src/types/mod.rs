// Core types for the autonomy kernel: proposed calls, execution events,
// trust scores, incidents, and the kernel state set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Origin of a proposed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallSource {
    /// LLM-driven planner.
    Llm,
    /// Direct human request.
    User,
    /// The runtime itself (schedulers, recovery jobs).
    System,
    /// A loaded plugin.
    Plugin,
    /// Edge trigger (e.g. wake-word detection).
    Trigger,
}

impl std::fmt::Display for CallSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llm => f.write_str("llm"),
            Self::User => f.write_str("user"),
            Self::System => f.write_str("system"),
            Self::Plugin => f.write_str("plugin"),
            Self::Trigger => f.write_str("trigger"),
        }
    }
}

/// Declared side-effect class of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskClass {
    /// No externally visible side effects.
    ReadOnly,
    /// Side effects that a registered compensation action can undo.
    Reversible,
    /// Side effects that cannot be undone.
    Irreversible,
}

impl std::fmt::Display for RiskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly => f.write_str("read-only"),
            Self::Reversible => f.write_str("reversible"),
            Self::Irreversible => f.write_str("irreversible"),
        }
    }
}

impl std::str::FromStr for RiskClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read-only" => Ok(Self::ReadOnly),
            "reversible" => Ok(Self::Reversible),
            "irreversible" => Ok(Self::Irreversible),
            other => Err(anyhow::anyhow!("unknown risk class: {other}")),
        }
    }
}

/// A tool call proposed by a planner, user, or the runtime.
///
/// Immutable: created at pipeline entry, dropped at pipeline exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedToolCall {
    /// Tool name as registered in the contract registry.
    pub tool: String,
    /// Raw parameters supplied by the caller.
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Where this call originated.
    pub source: CallSource,
    /// Caller-assigned request identifier.
    pub request_id: String,
}

impl ProposedToolCall {
    /// Build a call from a tool name, a JSON object of params, and a source.
    ///
    /// Non-object `params` values are treated as an empty parameter map.
    pub fn new(
        tool: impl Into<String>,
        params: serde_json::Value,
        source: CallSource,
        request_id: impl Into<String>,
    ) -> Self {
        let params = match params {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            tool: tool.into(),
            params,
            source,
            request_id: request_id.into(),
        }
    }
}

/// Event type discriminator for the execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Call entered the pipeline.
    #[serde(rename = "proposed")]
    Proposed,
    /// Contract validation passed.
    #[serde(rename = "validated")]
    Validated,
    /// Approval requested from a human or the system.
    #[serde(rename = "approval:requested")]
    ApprovalRequested,
    /// Approval resolved (approved, denied, or expired).
    #[serde(rename = "approval:resolved")]
    ApprovalResolved,
    /// Action handler invocation started.
    #[serde(rename = "executing")]
    Executing,
    /// Action handler returned.
    #[serde(rename = "executed")]
    Executed,
    /// Post-condition verification completed.
    #[serde(rename = "verified")]
    Verified,
    /// Compensation action ran.
    #[serde(rename = "compensated")]
    Compensated,
    /// Unresolved compensation failure recorded for operators.
    #[serde(rename = "compensation:incident:opened")]
    CompensationIncidentOpened,
    /// Cross-system invariants were evaluated.
    #[serde(rename = "invariants:checked")]
    InvariantsChecked,
    /// Terminal decision summary for the run.
    #[serde(rename = "decision:logged")]
    DecisionLogged,
    /// A stage failed; payload carries the reason.
    #[serde(rename = "failed")]
    Failed,
}

impl EventType {
    /// Wire name of the event type (matches the serde rename).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Validated => "validated",
            Self::ApprovalRequested => "approval:requested",
            Self::ApprovalResolved => "approval:resolved",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::Verified => "verified",
            Self::Compensated => "compensated",
            Self::CompensationIncidentOpened => "compensation:incident:opened",
            Self::InvariantsChecked => "invariants:checked",
            Self::DecisionLogged => "decision:logged",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the hash-chained execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Monotonic position in the global log.
    pub sequence_id: u64,
    /// Request the event belongs to.
    pub request_id: String,
    /// Pipeline run the event belongs to.
    pub correlation_id: String,
    /// What happened.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Stage-specific evidence.
    pub payload: serde_json::Value,
    /// When the event was appended.
    pub timestamp: DateTime<Utc>,
    /// Hash of the previous event in the global chain.
    pub prev_hash: String,
    /// SHA-256 over the canonical JSON of this event's content.
    pub event_hash: String,
}

/// Decision recorded for an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    /// Reviewer allowed the call.
    Approved,
    /// Reviewer refused the call.
    Denied,
    /// The request timed out without a decision.
    Expired,
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => f.write_str("approved"),
            Self::Denied => f.write_str("denied"),
            Self::Expired => f.write_str("expired"),
        }
    }
}

impl std::str::FromStr for ApprovalDecision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            "expired" => Ok(Self::Expired),
            other => Err(anyhow::anyhow!("unknown approval decision: {other}")),
        }
    }
}

/// An approval request pending a human or system decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique request ID.
    pub id: Uuid,
    /// The call awaiting a decision.
    pub call: ProposedToolCall,
    /// Risk class of the tool, for reviewer context.
    pub risk_class: RiskClass,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// When the request auto-expires.
    pub expires_at: DateTime<Utc>,
}

/// Per-dimension breakdown of a trust score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrustDimensions {
    /// Running reliability of the content's source.
    pub source_reliability: f64,
    /// Internal consistency of the content itself.
    pub content_consistency: f64,
    /// Plausibility of the content's timing.
    pub temporal_coherence: f64,
    /// Absence of embedded instructions / injection attempts.
    pub instruction_alignment: f64,
}

/// Composite trust score for inbound content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustScore {
    /// Aggregate in [0, 1]; the sentinel -1.0 means "gate disabled".
    pub score: f64,
    /// Per-dimension values.
    pub dimensions: TrustDimensions,
    /// Human-readable notes explaining deductions.
    pub reasoning: Vec<String>,
    /// When the score was computed.
    pub computed_at: DateTime<Utc>,
}

impl TrustScore {
    /// Sentinel score returned when the memory gate is disabled.
    ///
    /// The -1.0 value is reserved; it never results from actual scoring.
    pub fn sentinel() -> Self {
        Self {
            score: -1.0,
            dimensions: TrustDimensions {
                source_reliability: -1.0,
                content_consistency: -1.0,
                temporal_coherence: -1.0,
                instruction_alignment: -1.0,
            },
            reasoning: vec!["gate disabled, score not computed".to_owned()],
            computed_at: Utc::now(),
        }
    }
}

/// Lifecycle status of a compensation incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    /// Awaiting operator attention.
    Open,
    /// An operator has seen it.
    Acknowledged,
    /// Closed with a resolution note.
    Resolved,
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Acknowledged => f.write_str("acknowledged"),
            Self::Resolved => f.write_str("resolved"),
        }
    }
}

impl std::str::FromStr for IncidentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "acknowledged" => Ok(Self::Acknowledged),
            "resolved" => Ok(Self::Resolved),
            other => Err(anyhow::anyhow!("unknown incident status: {other}")),
        }
    }
}

/// Record of a compensation that failed or was never attempted.
///
/// Status only moves forward: open, acknowledged, resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationIncident {
    /// Unique incident ID.
    pub id: Uuid,
    /// Request whose compensation failed.
    pub request_id: String,
    /// Tool whose side effects are unresolved.
    pub tool_name: String,
    /// Pipeline run the failure belongs to.
    pub correlation_id: String,
    /// Why compensation was needed.
    pub reason: String,
    /// Whether a compensation action ran at all.
    pub compensation_attempted: bool,
    /// Whether the compensation action reported success.
    pub compensation_success: bool,
    /// Current lifecycle status.
    pub status: IncidentStatus,
    /// When the incident was opened.
    pub created_at: DateTime<Utc>,
    /// When the incident last changed.
    pub updated_at: DateTime<Utc>,
    /// When an operator acknowledged it.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Who acknowledged it.
    pub acknowledged_by: Option<String>,
    /// When it was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// Operator note describing the resolution.
    pub resolution_note: Option<String>,
}

/// Kernel-wide execution state. Only the state machine mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    /// Nothing in flight.
    Idle,
    /// A planner is composing calls.
    Planning,
    /// An action handler is running.
    Executing,
    /// Post-conditions are being checked.
    Verifying,
    /// Results are being committed to memory.
    WritingMemory,
    /// Cross-system invariants and the decision log are being written.
    Auditing,
    /// Blocked on a human or system approval.
    AwaitingApproval,
    /// Degraded mode: only read-only tools may run.
    SafeMode,
    /// A fatal error occurred; `recover` returns to idle.
    Error,
}

impl std::fmt::Display for KernelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Planning => f.write_str("planning"),
            Self::Executing => f.write_str("executing"),
            Self::Verifying => f.write_str("verifying"),
            Self::WritingMemory => f.write_str("writing_memory"),
            Self::Auditing => f.write_str("auditing"),
            Self::AwaitingApproval => f.write_str("awaiting_approval"),
            Self::SafeMode => f.write_str("safe_mode"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Triggers accepted by the kernel state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelTrigger {
    /// Validation passed; begin execution.
    ToolValidated,
    /// The contract demands an approval before execution.
    ApprovalRequired,
    /// Reviewer approved; begin execution.
    ApprovalGranted,
    /// Reviewer denied; return to idle.
    ApprovalDenied,
    /// Approval timed out; return to idle.
    ApprovalExpired,
    /// Handler finished; begin verification.
    ExecutionComplete,
    /// Post-conditions held.
    VerificationPassed,
    /// Post-conditions failed critically.
    VerificationFailed,
    /// Memory commit finished.
    MemoryWritten,
    /// Audit stage finished; return to idle.
    AuditComplete,
    /// Leave the error state.
    Recover,
    /// Degrade to safe mode (allowed from any state).
    EnterSafeMode,
    /// Leave safe mode; only accepted when the exit was approved.
    ExitSafeMode {
        /// Whether an explicit approval backs the exit.
        approved: bool,
    },
    /// Unrecoverable failure (allowed from any state).
    FatalError,
}

impl std::fmt::Display for KernelTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolValidated => f.write_str("tool_validated"),
            Self::ApprovalRequired => f.write_str("approval_required"),
            Self::ApprovalGranted => f.write_str("approval_granted"),
            Self::ApprovalDenied => f.write_str("approval_denied"),
            Self::ApprovalExpired => f.write_str("approval_expired"),
            Self::ExecutionComplete => f.write_str("execution_complete"),
            Self::VerificationPassed => f.write_str("verification_passed"),
            Self::VerificationFailed => f.write_str("verification_failed"),
            Self::MemoryWritten => f.write_str("memory_written"),
            Self::AuditComplete => f.write_str("audit_complete"),
            Self::Recover => f.write_str("recover"),
            Self::EnterSafeMode => f.write_str("enter_safe_mode"),
            Self::ExitSafeMode { .. } => f.write_str("exit_safe_mode"),
            Self::FatalError => f.write_str("fatal_error"),
        }
    }
}
