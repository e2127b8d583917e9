//! Tool execution pipeline -- the orchestrator.
//!
//! Drives a single proposed call through validation, approval routing,
//! execution, post-condition verification, compensation, and invariant
//! checking under one rule: every stage appends a hash-chained event,
//! and every failure is either compensated, recovered, or surfaced with
//! evidence. Errors never cross the pipeline boundary; callers always
//! receive a [`PipelineResult`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{topics, EventBus};
use crate::kernel::approval::ApprovalRouting;
use crate::kernel::compensation::{
    CompensationContext, CompensationOutcome, CompensationRegistry,
};
use crate::kernel::contracts::ContractRegistry;
use crate::kernel::event_store::EventStore;
use crate::kernel::incidents::{CompensationIncidentManager, IncidentReport};
use crate::kernel::invariants::{InvariantChecker, InvariantInput, InvariantReport};
use crate::kernel::state::KernelStateMachine;
use crate::kernel::validator::{SchemaValidator, ValidationReport};
use crate::kernel::verifier::{PostConditionVerifier, VerificationContext, VerificationReport};
use crate::metrics::KernelMetrics;
use crate::types::{
    ApprovalDecision, CallSource, EventType, KernelState, KernelTrigger, ProposedToolCall,
    RiskClass,
};

/// Default per-tool execution cap when the contract declares none.
const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

/// Action handler errors. The pipeline converts these into
/// `failed(execution_error)` events.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Output of a completed action handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    /// Tool result, fed to post-conditions and compensation.
    pub result: serde_json::Value,
    /// Handler-measured duration in milliseconds.
    pub duration_ms: u64,
}

/// The boundary to concrete tool implementations.
///
/// Handlers must be cancel-safe: the pipeline may drop the future at the
/// contract's duration cap or on caller cancellation.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Execute a validated call and return its result.
    async fn run(
        &self,
        tool: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        request_id: &str,
    ) -> Result<HandlerOutput, HandlerError>;
}

/// Failure classification carried in events and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Schema or contract mismatch.
    ValidationFailed,
    /// A reversible tool had no registered compensation action.
    CompensationUnregistered,
    /// Sliding-window rate limit exceeded.
    RateLimited,
    /// Caller trust below the contract's minimum.
    LowTrust,
    /// Blocked because the kernel is in safe mode.
    SafeModeRestricted,
    /// Reviewer refused the call.
    ApprovalDenied,
    /// Nobody decided within the TTL.
    ApprovalExpired,
    /// The action handler raised or timed out.
    ExecutionError,
    /// The caller cancelled mid-run.
    Cancelled,
    /// A post-condition failed at critical severity.
    CriticalVerificationFailure,
    /// A cross-system invariant was violated.
    CriticalInvariantViolation,
    /// A required state transition was rejected.
    StateMachineRejection,
}

impl FailureKind {
    /// Stable snake_case name used in `failed` event payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::CompensationUnregistered => "compensation_unregistered",
            Self::RateLimited => "rate_limited",
            Self::LowTrust => "low_trust",
            Self::SafeModeRestricted => "safe_mode_restricted",
            Self::ApprovalDenied => "approval_denied",
            Self::ApprovalExpired => "approval_expired",
            Self::ExecutionError => "execution_error",
            Self::Cancelled => "cancelled",
            Self::CriticalVerificationFailure => "critical_verification_failure",
            Self::CriticalInvariantViolation => "critical_invariant_violation",
            Self::StateMachineRejection => "state_machine_rejection",
        }
    }
}

/// Error summary carried in a failed result.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineFailure {
    /// What class of failure.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
}

/// Approval evidence in the result.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalSummary {
    /// The decision.
    pub decision: ApprovalDecision,
    /// Who decided, when known.
    pub decided_by: Option<String>,
}

/// Execution evidence in the result.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    /// Wall-clock duration of the handler call.
    pub duration_ms: u64,
    /// The handler's result value.
    pub result: serde_json::Value,
}

/// Everything a caller learns about one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Whether the call completed cleanly.
    pub success: bool,
    /// Echo of the caller's request id.
    pub request_id: String,
    /// Correlation id threading every event of this run.
    pub correlation_id: String,
    /// Failure summary when unsuccessful.
    pub error: Option<PipelineFailure>,
    /// Validation stage evidence.
    pub validation: Option<ValidationReport>,
    /// Approval stage evidence.
    pub approval: Option<ApprovalSummary>,
    /// Execution stage evidence.
    pub execution: Option<ExecutionSummary>,
    /// Verification stage evidence.
    pub verification: Option<VerificationReport>,
    /// Invariant stage evidence.
    pub invariants: Option<InvariantReport>,
    /// Compensation outcome, when one ran.
    pub compensation: Option<CompensationOutcome>,
    /// Incident opened for an unresolved compensation failure.
    pub incident_id: Option<Uuid>,
    /// Events this run appended to the store.
    pub events_appended: u64,
}

impl PipelineResult {
    /// Scalar reward in [-1, 1] for reinforcement-learning consumers.
    ///
    /// Clean success is 1; refusals are mildly negative; execution and
    /// integrity failures are strongly negative.
    pub fn reward_signal(&self) -> f64 {
        if self.success {
            return 1.0;
        }
        match self.error.as_ref().map(|e| e.kind) {
            Some(FailureKind::ApprovalDenied | FailureKind::ApprovalExpired) => -0.1,
            Some(
                FailureKind::ValidationFailed
                | FailureKind::RateLimited
                | FailureKind::LowTrust
                | FailureKind::SafeModeRestricted
                | FailureKind::CompensationUnregistered
                | FailureKind::StateMachineRejection,
            ) => -0.25,
            Some(FailureKind::ExecutionError | FailureKind::Cancelled) => -0.75,
            Some(
                FailureKind::CriticalVerificationFailure
                | FailureKind::CriticalInvariantViolation,
            )
            | None => -1.0,
        }
    }
}

/// Per-call options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Cancellation token; cancelling mid-run triggers compensation for
    /// stages that already produced side effects.
    pub cancel: CancellationToken,
    /// Trust score of the triggering content, when the caller has one.
    pub trust_score: Option<f64>,
}

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Concurrent runs admitted; excess callers wait FIFO.
    pub max_concurrent: usize,
    /// Fallback execution cap when a contract declares none.
    pub default_timeout_ms: u64,
    /// Skip approval for read-only tools even when the contract asks.
    pub auto_approve_read_only: bool,
    /// Sources whose calls never wait for approval.
    pub auto_approve_sources: Vec<CallSource>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            default_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
            auto_approve_read_only: true,
            auto_approve_sources: vec![CallSource::System],
        }
    }
}

/// Everything the orchestrator is wired with at init.
pub struct PipelineDeps {
    /// Frozen contract registry.
    pub contracts: Arc<ContractRegistry>,
    /// Hash-chained event log.
    pub store: Arc<EventStore>,
    /// Kernel-wide state machine.
    pub state: Arc<KernelStateMachine>,
    /// Approval gate (in-memory or persistent).
    pub approvals: Arc<dyn ApprovalRouting>,
    /// Post-condition verifier.
    pub verifier: Arc<PostConditionVerifier>,
    /// Cross-system invariant checker.
    pub invariants: Arc<InvariantChecker>,
    /// Compensation action registry.
    pub compensation: Arc<CompensationRegistry>,
    /// Incident tracker.
    pub incidents: Arc<CompensationIncidentManager>,
    /// Boundary to concrete tools.
    pub handler: Arc<dyn ActionHandler>,
    /// Outbound notification bus.
    pub bus: Arc<dyn EventBus>,
    /// Metric registry.
    pub metrics: Arc<KernelMetrics>,
}

/// Book-keeping for one run; lives on the stack of `execute`.
struct Run<'a> {
    call: &'a ProposedToolCall,
    correlation_id: String,
    events: u64,
    approvals_requested: u64,
    approvals_resolved: u64,
    saw_failed: bool,
}

/// The orchestrator.
pub struct ToolExecutionPipeline {
    deps: PipelineDeps,
    validator: SchemaValidator,
    config: PipelineConfig,
    semaphore: Arc<Semaphore>,
    rate_windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl std::fmt::Debug for ToolExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutionPipeline")
            .field("config", &self.config)
            .finish()
    }
}

impl ToolExecutionPipeline {
    /// Wire the orchestrator.
    pub fn new(deps: PipelineDeps, config: PipelineConfig) -> Self {
        let validator = SchemaValidator::new(Arc::clone(&deps.contracts));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            deps,
            validator,
            config,
            semaphore,
            rate_windows: Mutex::new(HashMap::new()),
        }
    }

    /// Append one event for this run and keep the incremental count.
    fn append(&self, run: &mut Run<'_>, event_type: EventType, payload: serde_json::Value) {
        self.deps.store.append(
            &run.call.request_id,
            event_type,
            payload,
            &run.correlation_id,
        );
        run.events = run.events.saturating_add(1);
        if event_type == EventType::Failed {
            run.saw_failed = true;
        }
    }

    /// Terminal bookkeeping shared by every exit path.
    fn finish(
        &self,
        run: &mut Run<'_>,
        mut result: PipelineResult,
        decision_payload: serde_json::Value,
    ) -> PipelineResult {
        self.append(run, EventType::DecisionLogged, decision_payload.clone());
        self.deps.bus.emit(topics::DECISION_LOGGED, decision_payload);
        self.deps.bus.emit(
            topics::PIPELINE_COMPLETED,
            json!({
                "requestId": run.call.request_id,
                "correlationId": run.correlation_id,
                "success": result.success,
            }),
        );
        result.events_appended = run.events;
        info!(
            request_id = %run.call.request_id,
            correlation_id = %run.correlation_id,
            success = result.success,
            events = run.events,
            "pipeline run finished"
        );
        result
    }

    fn failure(
        &self,
        run: &Run<'_>,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> PipelineResult {
        PipelineResult {
            success: false,
            request_id: run.call.request_id.clone(),
            correlation_id: run.correlation_id.clone(),
            error: Some(PipelineFailure {
                kind,
                message: message.into(),
            }),
            validation: None,
            approval: None,
            execution: None,
            verification: None,
            invariants: None,
            compensation: None,
            incident_id: None,
            events_appended: run.events,
        }
    }

    /// Check and update the sliding-window rate limit for a tool.
    fn rate_limited(&self, tool: &str, max: u32, window_ms: u64) -> bool {
        let mut windows = self
            .rate_windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let window = windows.entry(tool.to_owned()).or_default();
        let now = Instant::now();
        let horizon = Duration::from_millis(window_ms);
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > horizon)
        {
            window.pop_front();
        }
        if window.len() >= usize::try_from(max).unwrap_or(usize::MAX) {
            return true;
        }
        window.push_back(now);
        false
    }

    /// Run compensation for a failing call and open an incident when the
    /// tool is reversible and the gap stays unresolved.
    async fn compensate_and_track(
        &self,
        run: &mut Run<'_>,
        risk: RiskClass,
        track_incident: bool,
        compensation_action: Option<&str>,
        params: &serde_json::Map<String, serde_json::Value>,
        result: Option<&serde_json::Value>,
        reason: &str,
    ) -> (Option<CompensationOutcome>, Option<Uuid>) {
        let ctx = CompensationContext {
            tool_name: run.call.tool.clone(),
            params: params.clone(),
            result: result.cloned(),
            request_id: run.call.request_id.clone(),
        };

        let outcome = match compensation_action {
            Some(action) if self.deps.compensation.has(action) => {
                self.deps.bus.emit(
                    topics::COMPENSATION_ATTEMPTED,
                    json!({
                        "tool": run.call.tool,
                        "action": action,
                        "requestId": run.call.request_id,
                    }),
                );
                let outcome = self.deps.compensation.compensate(action, &ctx).await;
                self.append(
                    run,
                    EventType::Compensated,
                    json!({
                        "action": action,
                        "success": outcome.success,
                        "detail": &outcome.detail,
                    }),
                );
                Some(outcome)
            }
            _ => None,
        };

        let attempted = outcome.is_some();
        let succeeded = outcome.as_ref().is_some_and(|o| o.success);
        let incident_id = if track_incident
            && risk == RiskClass::Reversible
            && (!attempted || !succeeded)
        {
            let incident = self
                .deps
                .incidents
                .open(IncidentReport {
                    request_id: run.call.request_id.clone(),
                    tool_name: run.call.tool.clone(),
                    correlation_id: run.correlation_id.clone(),
                    reason: reason.to_owned(),
                    compensation_attempted: attempted,
                    compensation_success: succeeded,
                })
                .await;
            self.append(
                run,
                EventType::CompensationIncidentOpened,
                json!({
                    "incidentId": incident.id.to_string(),
                    "status": incident.status.to_string(),
                    "reason": reason,
                }),
            );
            Some(incident.id)
        } else {
            None
        };

        (outcome, incident_id)
    }

    /// Evaluate cross-system invariants with the run's incremental facts.
    fn run_invariants(
        &self,
        run: &Run<'_>,
        risk: RiskClass,
        execution_attempted: bool,
        execution_succeeded: bool,
        success_so_far: bool,
    ) -> InvariantReport {
        let input = InvariantInput {
            current_state: self.deps.state.current(),
            pending_approval_count: self.deps.approvals.pending_count(),
            event_count: run.events,
            execution_succeeded,
            execution_attempted,
            risk_class: risk,
            approvals_requested: run.approvals_requested,
            approvals_resolved: run.approvals_resolved,
            saw_failed_event: run.saw_failed,
            pipeline_result: json!({"success": success_so_far}),
        };
        let started = Instant::now();
        let report = self.deps.invariants.check(&input);
        self.deps.metrics.record_stage(
            "invariants",
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        );
        self.deps.bus.emit(
            topics::INVARIANTS_CHECKED,
            json!({
                "requestId": run.call.request_id,
                "status": report.status,
                "hasCriticalViolation": report.has_critical_violation,
            }),
        );
        report
    }

    /// Drive one proposed call through the full pipeline.
    ///
    /// Never returns an error; every outcome is a [`PipelineResult`]
    /// carrying the evidence needed to reconstruct the decision.
    pub async fn execute(&self, call: ProposedToolCall, ctx: CallContext) -> PipelineResult {
        // FIFO backpressure; the semaphore is never closed.
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_closed) => {
                let run = Run {
                    call: &call,
                    correlation_id: Uuid::new_v4().to_string(),
                    events: 0,
                    approvals_requested: 0,
                    approvals_resolved: 0,
                    saw_failed: false,
                };
                return self.failure(&run, FailureKind::StateMachineRejection, "pipeline closed");
            }
        };

        let mut run = Run {
            call: &call,
            correlation_id: Uuid::new_v4().to_string(),
            events: 0,
            approvals_requested: 0,
            approvals_resolved: 0,
            saw_failed: false,
        };

        self.deps.bus.emit(
            topics::PIPELINE_STARTED,
            json!({
                "requestId": call.request_id,
                "correlationId": run.correlation_id,
                "tool": call.tool,
                "source": call.source.to_string(),
            }),
        );
        self.append(
            &mut run,
            EventType::Proposed,
            json!({
                "tool": call.tool,
                "source": call.source.to_string(),
            }),
        );

        // ── Stage: validate ──
        let validate_started = Instant::now();
        let validation = self.validator.validate(&call);
        self.deps.metrics.record_stage(
            "validate",
            u64::try_from(validate_started.elapsed().as_millis()).unwrap_or(u64::MAX),
        );
        if !validation.valid {
            self.append(
                &mut run,
                EventType::Failed,
                json!({
                    "reason": FailureKind::ValidationFailed.as_str(),
                    "errors": validation.errors,
                }),
            );
            let mut result = self.failure(
                &run,
                FailureKind::ValidationFailed,
                format!("{} validation error(s)", validation.errors.len()),
            );
            result.validation = Some(validation.clone());
            let payload = json!({
                "requestId": call.request_id,
                "success": false,
                "validation": {"valid": false, "errors": validation.errors},
                "error": FailureKind::ValidationFailed.as_str(),
            });
            return self.finish(&mut run, result, payload);
        }

        // Risk class is present for every registered contract.
        let risk = validation.risk_class.unwrap_or(RiskClass::ReadOnly);
        let params = validation.validated_params.clone();
        // Contract fields needed beyond this point, cloned out so the
        // registry borrow does not outlive the await points below.
        let (max_duration_ms, rate_limit, min_trust, compensation_action) = {
            let compiled = self.deps.contracts.get(&call.tool);
            match compiled {
                Some(c) => (
                    c.contract.max_duration_ms,
                    c.contract.rate_limit,
                    c.contract.min_trust_score,
                    c.contract.compensation_action.clone(),
                ),
                None => (self.config.default_timeout_ms, None, 0.0, None),
            }
        };
        self.append(
            &mut run,
            EventType::Validated,
            json!({
                "riskClass": risk.to_string(),
                "requiresApproval": validation.requires_approval,
            }),
        );

        // ── Gate: reversible tools need a registered compensation ──
        if risk == RiskClass::Reversible
            && !compensation_action
                .as_deref()
                .is_some_and(|a| self.deps.compensation.has(a))
        {
            self.append(
                &mut run,
                EventType::Failed,
                json!({
                    "reason": FailureKind::CompensationUnregistered.as_str(),
                    "tool": call.tool,
                }),
            );
            let mut result = self.failure(
                &run,
                FailureKind::CompensationUnregistered,
                "reversible tool has no registered compensation action",
            );
            result.validation = Some(validation.clone());
            let payload = json!({
                "requestId": call.request_id,
                "success": false,
                "error": FailureKind::CompensationUnregistered.as_str(),
            });
            return self.finish(&mut run, result, payload);
        }

        // ── Gate: rate limit ──
        if let Some(limit) = rate_limit {
            if self.rate_limited(&call.tool, limit.max, limit.window_ms) {
                self.append(
                    &mut run,
                    EventType::Failed,
                    json!({
                        "reason": FailureKind::RateLimited.as_str(),
                        "max": limit.max,
                        "windowMs": limit.window_ms,
                    }),
                );
                let result = self.failure(
                    &run,
                    FailureKind::RateLimited,
                    format!("more than {} calls in {}ms", limit.max, limit.window_ms),
                );
                let payload = json!({
                    "requestId": call.request_id,
                    "success": false,
                    "error": FailureKind::RateLimited.as_str(),
                });
                return self.finish(&mut run, result, payload);
            }
        }

        // ── Gate: minimum trust ──
        if min_trust > 0.0 {
            if let Some(trust) = ctx.trust_score {
                if trust < min_trust {
                    self.append(
                        &mut run,
                        EventType::Failed,
                        json!({
                            "reason": FailureKind::LowTrust.as_str(),
                            "trust": trust,
                            "minTrust": min_trust,
                        }),
                    );
                    let result = self.failure(
                        &run,
                        FailureKind::LowTrust,
                        format!("trust {trust:.2} below contract minimum {min_trust:.2}"),
                    );
                    let payload = json!({
                        "requestId": call.request_id,
                        "success": false,
                        "error": FailureKind::LowTrust.as_str(),
                    });
                    return self.finish(&mut run, result, payload);
                }
            }
        }

        // ── Gate: safe mode ──
        let in_safe_mode = self.deps.state.current() == KernelState::SafeMode;
        if in_safe_mode && risk != RiskClass::ReadOnly {
            self.append(
                &mut run,
                EventType::Failed,
                json!({
                    "reason": FailureKind::SafeModeRestricted.as_str(),
                    "state": KernelState::SafeMode.to_string(),
                    "riskClass": risk.to_string(),
                }),
            );
            self.deps.bus.emit(
                topics::SAFE_MODE_TOOL_BLOCKED,
                json!({
                    "tool": call.tool,
                    "requestId": call.request_id,
                    "riskClass": risk.to_string(),
                }),
            );
            let mut result = self.failure(
                &run,
                FailureKind::SafeModeRestricted,
                "kernel is in safe mode; only read-only tools may run",
            );
            result.validation = Some(validation.clone());
            let payload = json!({
                "requestId": call.request_id,
                "success": false,
                "error": FailureKind::SafeModeRestricted.as_str(),
            });
            return self.finish(&mut run, result, payload);
        }

        // ── Stage: approval routing ──
        let approval_required = validation.requires_approval
            && !(self.config.auto_approve_read_only && risk == RiskClass::ReadOnly)
            && !self.config.auto_approve_sources.contains(&call.source);

        let mut approval_summary = None;
        if approval_required {
            if in_safe_mode {
                // Read-only call in safe mode that still demands approval:
                // the machine stays in safe_mode, so refuse rather than
                // fake an awaiting_approval transition.
                return self.reject_transition(
                    &mut run,
                    &validation,
                    "approval routing is unavailable in safe_mode",
                );
            }
            let outcome = self.deps.state.transition(KernelTrigger::ApprovalRequired);
            if !outcome.accepted {
                return self.reject_transition(
                    &mut run,
                    &validation,
                    outcome.reason.unwrap_or_else(|| "transition rejected".to_owned()),
                );
            }

            let pending = self.deps.approvals.request_approval(&call, risk).await;
            self.append(
                &mut run,
                EventType::ApprovalRequested,
                json!({
                    "approvalId": pending.id.to_string(),
                    "riskClass": risk.to_string(),
                }),
            );
            run.approvals_requested = run.approvals_requested.saturating_add(1);

            let awaited = tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => {
                    // Caller walked away mid-wait. Leave the request to
                    // its timer and fail this run as cancelled.
                    self.append(
                        &mut run,
                        EventType::Failed,
                        json!({
                            "reason": FailureKind::Cancelled.as_str(),
                            "stage": "approval",
                        }),
                    );
                    self.deps.state.transition(KernelTrigger::FatalError);
                    self.deps.state.transition(KernelTrigger::Recover);
                    let mut result = self.failure(
                        &run,
                        FailureKind::Cancelled,
                        "caller cancelled while awaiting approval",
                    );
                    result.validation = Some(validation.clone());
                    let payload = json!({
                        "requestId": call.request_id,
                        "success": false,
                        "error": FailureKind::Cancelled.as_str(),
                    });
                    return self.finish(&mut run, result, payload);
                }
                outcome = pending.receiver => outcome.ok(),
            };

            let (decision, decided_by) = match awaited {
                Some(outcome) => (outcome.decision, outcome.decided_by),
                // Gate disposed: nobody will ever decide.
                None => (ApprovalDecision::Expired, None),
            };
            self.append(
                &mut run,
                EventType::ApprovalResolved,
                json!({
                    "approvalId": pending.id.to_string(),
                    "decision": decision.to_string(),
                    "decidedBy": &decided_by,
                }),
            );
            run.approvals_resolved = run.approvals_resolved.saturating_add(1);
            approval_summary = Some(ApprovalSummary {
                decision,
                decided_by,
            });

            match decision {
                ApprovalDecision::Approved => {
                    self.deps.state.transition(KernelTrigger::ApprovalGranted);
                }
                ApprovalDecision::Denied | ApprovalDecision::Expired => {
                    let (trigger, kind) = if decision == ApprovalDecision::Denied {
                        (KernelTrigger::ApprovalDenied, FailureKind::ApprovalDenied)
                    } else {
                        (KernelTrigger::ApprovalExpired, FailureKind::ApprovalExpired)
                    };
                    self.deps.state.transition(trigger);
                    let mut result =
                        self.failure(&run, kind, format!("approval {decision}"));
                    result.validation = Some(validation.clone());
                    result.approval = approval_summary;
                    let payload = json!({
                        "requestId": call.request_id,
                        "success": false,
                        "approval": {"outcome": decision.to_string()},
                        "error": kind.as_str(),
                    });
                    return self.finish(&mut run, result, payload);
                }
            }
        } else if !in_safe_mode {
            let outcome = self.deps.state.transition(KernelTrigger::ToolValidated);
            if !outcome.accepted {
                return self.reject_transition(
                    &mut run,
                    &validation,
                    outcome.reason.unwrap_or_else(|| "transition rejected".to_owned()),
                );
            }
        }
        // In safe mode with a read-only tool the machine stays in
        // safe_mode for the whole run; events are still appended.

        // ── Stage: execute ──
        self.append(&mut run, EventType::Executing, json!({"tool": call.tool}));
        let cap = Duration::from_millis(if max_duration_ms == 0 {
            self.config.default_timeout_ms
        } else {
            max_duration_ms
        });
        let exec_started = Instant::now();
        let handler_outcome = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => Err(FailureKind::Cancelled),
            handled = tokio::time::timeout(
                cap,
                self.deps.handler.run(&call.tool, &params, &call.request_id),
            ) => match handled {
                Err(_elapsed) => Err(FailureKind::ExecutionError),
                Ok(Err(_handler_err)) => Err(FailureKind::ExecutionError),
                Ok(Ok(output)) => Ok(output),
            },
        };
        let exec_elapsed =
            u64::try_from(exec_started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.deps.metrics.record_stage("execute", exec_elapsed);

        let output = match handler_outcome {
            Ok(output) => output,
            Err(kind) => {
                let message = match kind {
                    FailureKind::Cancelled => "caller cancelled during execution".to_owned(),
                    _ => format!("handler failed or exceeded {}ms", cap.as_millis()),
                };
                self.append(
                    &mut run,
                    EventType::Failed,
                    json!({"reason": kind.as_str(), "message": &message}),
                );
                if !in_safe_mode {
                    self.deps.state.transition(KernelTrigger::FatalError);
                }

                // Side effects may exist; attempt the registered reverse.
                // Execution errors compensate but do not open incidents.
                let (compensation, _incident) = self
                    .compensate_and_track(
                        &mut run,
                        risk,
                        false,
                        compensation_action.as_deref(),
                        &params,
                        None,
                        kind.as_str(),
                    )
                    .await;
                if !in_safe_mode {
                    self.deps.state.transition(KernelTrigger::Recover);
                }

                let mut result = self.failure(&run, kind, message);
                result.validation = Some(validation.clone());
                result.approval = approval_summary;
                result.compensation = compensation;
                let payload = json!({
                    "requestId": call.request_id,
                    "success": false,
                    "error": kind.as_str(),
                });
                return self.finish(&mut run, result, payload);
            }
        };
        self.append(
            &mut run,
            EventType::Executed,
            json!({"durationMs": output.duration_ms}),
        );
        if !in_safe_mode {
            self.deps.state.transition(KernelTrigger::ExecutionComplete);
        }

        // ── Stage: verify ──
        let verify_started = Instant::now();
        let verification = self
            .deps
            .verifier
            .verify(&VerificationContext {
                tool_name: call.tool.clone(),
                params: params.clone(),
                result: output.result.clone(),
                request_id: call.request_id.clone(),
            })
            .await;
        self.deps.metrics.record_stage(
            "verify",
            u64::try_from(verify_started.elapsed().as_millis()).unwrap_or(u64::MAX),
        );
        self.append(
            &mut run,
            EventType::Verified,
            json!({
                "status": verification.status,
                "hasCriticalFailure": verification.has_critical_failure,
                "checks": verification.checks.len(),
            }),
        );
        self.deps.bus.emit(
            topics::POSTCONDITION_CHECKED,
            json!({
                "tool": call.tool,
                "requestId": call.request_id,
                "status": verification.status,
                "hasCriticalFailure": verification.has_critical_failure,
            }),
        );

        if verification.has_critical_failure {
            if !in_safe_mode {
                self.deps.state.transition(KernelTrigger::VerificationFailed);
            }
            let (compensation, incident_id) = self
                .compensate_and_track(
                    &mut run,
                    risk,
                    true,
                    compensation_action.as_deref(),
                    &params,
                    Some(&output.result),
                    FailureKind::CriticalVerificationFailure.as_str(),
                )
                .await;
            if !in_safe_mode {
                self.deps.state.transition(KernelTrigger::Recover);
            }

            let invariants = self.run_invariants(&run, risk, true, true, false);
            self.append(
                &mut run,
                EventType::InvariantsChecked,
                json!({
                    "status": invariants.status,
                    "hasCriticalViolation": invariants.has_critical_violation,
                }),
            );

            let mut result = self.failure(
                &run,
                FailureKind::CriticalVerificationFailure,
                "post-condition failed at critical severity",
            );
            result.validation = Some(validation.clone());
            result.approval = approval_summary;
            result.execution = Some(ExecutionSummary {
                duration_ms: output.duration_ms,
                result: output.result.clone(),
            });
            result.verification = Some(verification.clone());
            result.invariants = Some(invariants);
            result.compensation = compensation;
            result.incident_id = incident_id;
            let payload = json!({
                "requestId": call.request_id,
                "success": false,
                "verification": {"hasCriticalFailure": true},
                "error": FailureKind::CriticalVerificationFailure.as_str(),
            });
            return self.finish(&mut run, result, payload);
        }

        if !in_safe_mode {
            self.deps.state.transition(KernelTrigger::VerificationPassed);
            self.deps.state.transition(KernelTrigger::MemoryWritten);
        }

        // ── Stage: invariants (success path) ──
        let invariants = self.run_invariants(&run, risk, true, true, true);
        self.append(
            &mut run,
            EventType::InvariantsChecked,
            json!({
                "status": invariants.status,
                "hasCriticalViolation": invariants.has_critical_violation,
            }),
        );

        if invariants.has_critical_violation {
            let (compensation, incident_id) = self
                .compensate_and_track(
                    &mut run,
                    risk,
                    true,
                    compensation_action.as_deref(),
                    &params,
                    Some(&output.result),
                    FailureKind::CriticalInvariantViolation.as_str(),
                )
                .await;
            self.append(
                &mut run,
                EventType::Failed,
                json!({"reason": FailureKind::CriticalInvariantViolation.as_str()}),
            );
            if !in_safe_mode {
                self.deps.state.transition(KernelTrigger::FatalError);
                self.deps.state.transition(KernelTrigger::Recover);
            }

            let mut result = self.failure(
                &run,
                FailureKind::CriticalInvariantViolation,
                "cross-system invariant violated",
            );
            result.validation = Some(validation.clone());
            result.approval = approval_summary;
            result.execution = Some(ExecutionSummary {
                duration_ms: output.duration_ms,
                result: output.result.clone(),
            });
            result.verification = Some(verification.clone());
            result.invariants = Some(invariants);
            result.compensation = compensation;
            result.incident_id = incident_id;
            let payload = json!({
                "requestId": call.request_id,
                "success": false,
                "error": FailureKind::CriticalInvariantViolation.as_str(),
            });
            return self.finish(&mut run, result, payload);
        }

        // ── Terminal: success ──
        let result = PipelineResult {
            success: true,
            request_id: call.request_id.clone(),
            correlation_id: run.correlation_id.clone(),
            error: None,
            validation: Some(validation),
            approval: approval_summary,
            execution: Some(ExecutionSummary {
                duration_ms: output.duration_ms,
                result: output.result,
            }),
            verification: Some(verification.clone()),
            invariants: Some(invariants.clone()),
            compensation: None,
            incident_id: None,
            events_appended: run.events,
        };
        let payload = json!({
            "requestId": call.request_id,
            "success": true,
            "validation": {"valid": true},
            "approval": result
                .approval
                .as_ref()
                .map(|a| json!({"outcome": a.decision.to_string()})),
            "verification": {"status": verification.status},
            "invariants": {"status": invariants.status},
        });
        let result = self.finish(&mut run, result, payload);
        if !in_safe_mode {
            self.deps.state.transition(KernelTrigger::AuditComplete);
        }
        result
    }

    /// Shared failure path for rejected state transitions.
    fn reject_transition(
        &self,
        run: &mut Run<'_>,
        validation: &ValidationReport,
        reason: impl Into<String>,
    ) -> PipelineResult {
        let reason = reason.into();
        warn!(
            request_id = %run.call.request_id,
            reason,
            "pipeline refused: state transition rejected"
        );
        self.append(
            run,
            EventType::Failed,
            json!({
                "reason": FailureKind::StateMachineRejection.as_str(),
                "detail": &reason,
            }),
        );
        let mut result = self.failure(run, FailureKind::StateMachineRejection, reason);
        result.validation = Some(validation.clone());
        let payload = json!({
            "requestId": run.call.request_id,
            "success": false,
            "error": FailureKind::StateMachineRejection.as_str(),
        });
        self.finish(run, result, payload)
    }
}
