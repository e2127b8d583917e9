//! End-to-end pipeline scenarios: the six canonical flows through a
//! fully wired kernel with mock tools.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use turing::bus::{topics, RecordingBus};
use turing::kernel::approval::{ApprovalGate, ApprovalRouting};
use turing::kernel::compensation::{CompensationOutcome, CompensationRegistry};
use turing::kernel::contracts::{ContractRegistry, ToolContract};
use turing::kernel::event_store::EventStore;
use turing::kernel::incidents::CompensationIncidentManager;
use turing::kernel::invariants::InvariantChecker;
use turing::kernel::pipeline::{
    ActionHandler, CallContext, FailureKind, HandlerError, HandlerOutput, PipelineConfig,
    PipelineDeps, ToolExecutionPipeline,
};
use turing::kernel::state::KernelStateMachine;
use turing::kernel::validator::{FieldKind, FieldSpec, ParamSchema};
use turing::kernel::verifier::{CheckResult, PostConditionVerifier};
use turing::metrics::KernelMetrics;
use turing::types::{ApprovalDecision, CallSource, KernelState, ProposedToolCall};

// ── Shared harness ──────────────────────────────────────────────

struct CountingHandler {
    invocations: AtomicU64,
}

#[async_trait::async_trait]
impl ActionHandler for CountingHandler {
    async fn run(
        &self,
        tool: &str,
        _params: &serde_json::Map<String, serde_json::Value>,
        _request_id: &str,
    ) -> Result<HandlerOutput, HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerOutput {
            result: json!({"tool": tool, "done": true}),
            duration_ms: 1,
        })
    }
}

struct Kernel {
    pipeline: Arc<ToolExecutionPipeline>,
    gate: Arc<ApprovalGate>,
    store: Arc<EventStore>,
    state: Arc<KernelStateMachine>,
    bus: Arc<RecordingBus>,
    handler: Arc<CountingHandler>,
}

/// Wire a kernel with the three scenario contracts:
/// - `PLAY_EMOTE`: read-only, no approval
/// - `RUN_IN_TERMINAL`: irreversible, approval required
/// - `TRANSFER_FUNDS`: reversible with a `REFUND_TRANSFER` action whose
///   post-condition always fails critically
fn kernel(approval_timeout: Duration, compensation_succeeds: bool) -> Kernel {
    let mut contracts = ContractRegistry::new();

    let mut emote_fields = BTreeMap::new();
    emote_fields.insert("emote".to_owned(), FieldSpec::required(FieldKind::String));
    contracts
        .register(
            ToolContract::read_only("PLAY_EMOTE", "1.0.0").with_input_schema(ParamSchema {
                fields: emote_fields,
                allow_unknown: false,
            }),
        )
        .expect("register PLAY_EMOTE");
    contracts
        .register(ToolContract::irreversible("RUN_IN_TERMINAL", "1.0.0"))
        .expect("register RUN_IN_TERMINAL");
    contracts
        .register(ToolContract::reversible(
            "TRANSFER_FUNDS",
            "1.0.0",
            "REFUND_TRANSFER",
        ))
        .expect("register TRANSFER_FUNDS");

    let bus = Arc::new(RecordingBus::new());
    let metrics = Arc::new(KernelMetrics::new());
    let store = Arc::new(EventStore::default());
    let state = Arc::new(KernelStateMachine::new());
    let gate = Arc::new(ApprovalGate::new(approval_timeout, bus.clone()));
    let handler = Arc::new(CountingHandler {
        invocations: AtomicU64::new(0),
    });

    let mut verifier = PostConditionVerifier::new();
    verifier.register_fn("TRANSFER_FUNDS", "funds_credited", |_ctx| {
        CheckResult::critical("funds_credited", "destination never credited")
    });

    let mut compensation = CompensationRegistry::new();
    if compensation_succeeds {
        compensation.register_fn("REFUND_TRANSFER", |_ctx| CompensationOutcome::success());
    } else {
        compensation.register_fn("REFUND_TRANSFER", |_ctx| {
            CompensationOutcome::failure("refund rail offline")
        });
    }

    let deps = PipelineDeps {
        contracts: Arc::new(contracts),
        store: store.clone(),
        state: state.clone(),
        approvals: gate.clone() as Arc<dyn ApprovalRouting>,
        verifier: Arc::new(verifier),
        invariants: Arc::new(InvariantChecker::with_builtins(metrics.clone())),
        compensation: Arc::new(compensation),
        incidents: Arc::new(CompensationIncidentManager::new(bus.clone())),
        handler: handler.clone(),
        bus: bus.clone(),
        metrics,
    };

    Kernel {
        pipeline: Arc::new(ToolExecutionPipeline::new(deps, PipelineConfig::default())),
        gate,
        store,
        state,
        bus,
        handler,
    }
}

fn event_names(store: &EventStore, request_id: &str) -> Vec<&'static str> {
    store
        .get_by_request_id(request_id)
        .iter()
        .map(|e| e.event_type.as_str())
        .collect()
}

/// Poll until the approval gate has a pending request.
async fn wait_for_pending(gate: &ApprovalGate) -> uuid::Uuid {
    for _ in 0..1_000 {
        if let Some(request) = gate.pending().pop() {
            return request.id;
        }
        tokio::task::yield_now().await;
    }
    panic!("no approval request appeared");
}

// ── Scenario 1: read-only autopath ──────────────────────────────

#[tokio::test]
async fn scenario_read_only_autopath() {
    let kernel = kernel(Duration::from_secs(300), true);
    let call = ProposedToolCall::new(
        "PLAY_EMOTE",
        json!({"emote": "wave"}),
        CallSource::User,
        "req-emote",
    );

    let result = kernel.pipeline.execute(call, CallContext::default()).await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(
        event_names(&kernel.store, "req-emote"),
        vec![
            "proposed",
            "validated",
            "executing",
            "executed",
            "verified",
            "invariants:checked",
            "decision:logged",
        ]
    );
    assert!(
        kernel.bus.topic(topics::APPROVAL_REQUESTED).is_empty(),
        "no approval events on the autopath"
    );
    assert_eq!(kernel.state.current(), KernelState::Idle);

    let verdict = EventStore::verify_chain(&kernel.store.get_by_request_id("req-emote"));
    assert!(verdict.valid, "chain holds after the run: {verdict:?}");
}

// ── Scenario 2: approval denial ─────────────────────────────────

#[tokio::test]
async fn scenario_approval_denied() {
    let kernel = kernel(Duration::from_secs(300), true);
    let call = ProposedToolCall::new(
        "RUN_IN_TERMINAL",
        json!({}),
        CallSource::Llm,
        "req-term",
    );

    let pipeline = kernel.pipeline.clone();
    let task = tokio::spawn(async move { pipeline.execute(call, CallContext::default()).await });

    let approval_id = wait_for_pending(&kernel.gate).await;
    assert_eq!(kernel.state.current(), KernelState::AwaitingApproval);
    assert!(kernel
        .gate
        .resolve(approval_id, ApprovalDecision::Denied, Some("alice")));

    let result = task.await.expect("join");
    assert!(!result.success);
    assert_eq!(
        result.error.as_ref().map(|e| e.kind),
        Some(FailureKind::ApprovalDenied)
    );
    let approval = result.approval.expect("approval evidence");
    assert_eq!(approval.decision, ApprovalDecision::Denied);
    assert_eq!(approval.decided_by.as_deref(), Some("alice"));

    let names = event_names(&kernel.store, "req-term");
    assert!(!names.contains(&"executing"), "handler must never start");
    assert!(!names.contains(&"executed"));
    assert_eq!(kernel.handler.invocations.load(Ordering::SeqCst), 0);
    assert_eq!(*names.last().expect("events"), "decision:logged");
    assert_eq!(kernel.state.current(), KernelState::Idle);
}

// ── Scenario 3: schema rejection ────────────────────────────────

#[tokio::test]
async fn scenario_unknown_tool() {
    let kernel = kernel(Duration::from_secs(300), true);
    let call = ProposedToolCall::new(
        "NONEXISTENT_TOOL",
        json!({"anything": 1}),
        CallSource::Llm,
        "req-missing",
    );

    let result = kernel.pipeline.execute(call, CallContext::default()).await;

    assert!(!result.success);
    let names = event_names(&kernel.store, "req-missing");
    assert_eq!(
        names.iter().filter(|n| **n == "failed").count(),
        1,
        "exactly one failed event"
    );
    assert_eq!(kernel.handler.invocations.load(Ordering::SeqCst), 0);

    let failed = kernel
        .store
        .get_by_request_id("req-missing")
        .into_iter()
        .find(|e| e.event_type.as_str() == "failed")
        .expect("failed event");
    assert_eq!(failed.payload["reason"], "validation_failed");
}

// ── Scenario 4: critical verification, compensation succeeds ────

#[tokio::test]
async fn scenario_compensated_verification_failure() {
    let kernel = kernel(Duration::from_secs(300), true);
    let call = ProposedToolCall::new(
        "TRANSFER_FUNDS",
        json!({"amount": 50}),
        CallSource::Llm,
        "req-transfer",
    );

    let result = kernel.pipeline.execute(call, CallContext::default()).await;

    assert!(!result.success);
    assert_eq!(
        result.error.as_ref().map(|e| e.kind),
        Some(FailureKind::CriticalVerificationFailure)
    );
    assert!(result.compensation.expect("compensation ran").success);
    assert_eq!(result.incident_id, None, "no incident when compensation works");

    let events = kernel.store.get_by_request_id("req-transfer");
    let names: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    let verified_pos = names.iter().position(|n| *n == "verified").expect("verified");
    let compensated_pos = names
        .iter()
        .position(|n| *n == "compensated")
        .expect("compensated");
    let invariants_pos = names
        .iter()
        .position(|n| *n == "invariants:checked")
        .expect("invariants");
    assert!(verified_pos < compensated_pos && compensated_pos < invariants_pos);
    assert!(!names.contains(&"compensation:incident:opened"));

    let verified = &events[verified_pos];
    assert_eq!(verified.payload["hasCriticalFailure"], true);
    let compensated = &events[compensated_pos];
    assert_eq!(compensated.payload["success"], true);
}

// ── Scenario 5: compensation fails, incident opened ─────────────

#[tokio::test]
async fn scenario_compensation_failure_opens_incident() {
    let kernel = kernel(Duration::from_secs(300), false);
    let call = ProposedToolCall::new(
        "TRANSFER_FUNDS",
        json!({"amount": 50}),
        CallSource::Llm,
        "req-incident",
    );

    let result = kernel.pipeline.execute(call, CallContext::default()).await;

    assert!(!result.success);
    let incident_id = result.incident_id.expect("incident id in result");

    let events = kernel.store.get_by_request_id("req-incident");
    let incident_event = events
        .iter()
        .find(|e| e.event_type.as_str() == "compensation:incident:opened")
        .expect("incident event");
    assert_eq!(incident_event.payload["status"], "open");
    assert_eq!(
        incident_event.payload["incidentId"],
        incident_id.to_string()
    );

    assert_eq!(
        kernel.state.current(),
        KernelState::Idle,
        "recover returns the kernel to idle"
    );
    assert_eq!(
        kernel
            .bus
            .topic(topics::COMPENSATION_INCIDENT_OPENED)
            .len(),
        1
    );
}

// ── Scenario 6: approval timeout ────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scenario_approval_timeout() {
    let kernel = kernel(Duration::from_secs(10), true);
    let call = ProposedToolCall::new(
        "RUN_IN_TERMINAL",
        json!({}),
        CallSource::Llm,
        "req-timeout",
    );

    // Nobody answers; paused time lets the 10s timer fire immediately
    // once the pipeline awaits it.
    let result = kernel.pipeline.execute(call, CallContext::default()).await;

    assert!(!result.success);
    assert_eq!(
        result.error.as_ref().map(|e| e.kind),
        Some(FailureKind::ApprovalExpired)
    );
    let approval = result.approval.expect("approval evidence");
    assert_eq!(approval.decision, ApprovalDecision::Expired);
    assert_eq!(approval.decided_by, None);

    let names = event_names(&kernel.store, "req-timeout");
    assert!(!names.contains(&"executing"), "handler never invoked");
    assert_eq!(kernel.handler.invocations.load(Ordering::SeqCst), 0);
    assert_eq!(kernel.state.current(), KernelState::Idle);

    let resolved = kernel
        .store
        .get_by_request_id("req-timeout")
        .into_iter()
        .find(|e| e.event_type.as_str() == "approval:resolved")
        .expect("approval:resolved event");
    assert_eq!(resolved.payload["decision"], "expired");
}

// ── Cancellation ────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_during_approval_fails_run() {
    let kernel = kernel(Duration::from_secs(300), true);
    let call = ProposedToolCall::new(
        "RUN_IN_TERMINAL",
        json!({}),
        CallSource::Llm,
        "req-cancel",
    );

    let cancel = CancellationToken::new();
    let ctx = CallContext {
        cancel: cancel.clone(),
        trust_score: None,
    };
    let pipeline = kernel.pipeline.clone();
    let task = tokio::spawn(async move { pipeline.execute(call, ctx).await });

    let _approval_id = wait_for_pending(&kernel.gate).await;
    cancel.cancel();

    let result = task.await.expect("join");
    assert!(!result.success);
    assert_eq!(
        result.error.as_ref().map(|e| e.kind),
        Some(FailureKind::Cancelled)
    );
    assert_eq!(kernel.state.current(), KernelState::Idle);
}
