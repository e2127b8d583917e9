//! Turing CLI -- wire the autonomy kernel with in-memory adapters and
//! exercise it from a terminal.
//!
//! Subcommands:
//! - `demo`   -- register sample contracts and run a read-only call plus
//!   a compensated failure end to end, printing the event chain
//! - `gate`   -- score a line of text through the memory gate
//! - `verify` -- verify the hash chain of an exported JSONL event log

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use turing::bus::TracingBus;
use turing::config::TuringConfig;
use turing::kernel::approval::ApprovalGate;
use turing::kernel::compensation::{CompensationOutcome, CompensationRegistry};
use turing::kernel::contracts::{ContractRegistry, ToolContract};
use turing::kernel::event_store::EventStore;
use turing::kernel::incidents::CompensationIncidentManager;
use turing::kernel::invariants::InvariantChecker;
use turing::kernel::pipeline::{
    ActionHandler, CallContext, HandlerError, HandlerOutput, PipelineConfig, PipelineDeps,
    ToolExecutionPipeline,
};
use turing::kernel::state::KernelStateMachine;
use turing::kernel::validator::{FieldKind, FieldSpec, ParamSchema};
use turing::kernel::verifier::{CheckResult, PostConditionVerifier};
use turing::memory::gate::{GateDecision, MemoryGate};
use turing::memory::trust::{InboundContent, SourceKind, TrustScorer};
use turing::metrics::KernelMetrics;
use turing::types::{CallSource, ExecutionEvent, ProposedToolCall};

#[derive(Parser)]
#[command(name = "turing", about = "Autonomy kernel for agent tool execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run two showcase calls through a fully wired kernel.
    Demo,
    /// Score a line of text through the memory gate.
    Gate {
        /// The text to score.
        text: String,
    },
    /// Verify the hash chain of an exported JSONL event log.
    Verify {
        /// Path to a JSONL export.
        path: String,
    },
}

/// Demo handler: emotes succeed, transfers "lose" the funds so the
/// verification and compensation path lights up.
struct DemoHandler;

#[async_trait::async_trait]
impl ActionHandler for DemoHandler {
    async fn run(
        &self,
        tool: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        _request_id: &str,
    ) -> Result<HandlerOutput, HandlerError> {
        match tool {
            "PLAY_EMOTE" => Ok(HandlerOutput {
                result: json!({"played": params.get("emote")}),
                duration_ms: 2,
            }),
            "TRANSFER_FUNDS" => Ok(HandlerOutput {
                result: json!({"credited": false, "amount": params.get("amount")}),
                duration_ms: 11,
            }),
            other => Err(HandlerError(format!("no demo handler for {other}"))),
        }
    }
}

fn demo_contracts() -> Result<ContractRegistry> {
    let mut registry = ContractRegistry::new();

    let mut emote_fields = BTreeMap::new();
    emote_fields.insert(
        "emote".to_owned(),
        FieldSpec {
            one_of: Some(vec![json!("wave"), json!("bow"), json!("dance")]),
            ..FieldSpec::required(FieldKind::String)
        },
    );
    registry
        .register(
            ToolContract::read_only("PLAY_EMOTE", "1.0.0").with_input_schema(ParamSchema {
                fields: emote_fields,
                allow_unknown: false,
            }),
        )
        .context("register PLAY_EMOTE")?;

    let mut transfer_fields = BTreeMap::new();
    transfer_fields.insert(
        "amount".to_owned(),
        FieldSpec {
            min: Some(0.01),
            ..FieldSpec::required(FieldKind::Number)
        },
    );
    registry
        .register(
            ToolContract::reversible("TRANSFER_FUNDS", "1.0.0", "REFUND_TRANSFER")
                .with_input_schema(ParamSchema {
                    fields: transfer_fields,
                    allow_unknown: false,
                }),
        )
        .context("register TRANSFER_FUNDS")?;

    Ok(registry)
}

async fn run_demo() -> Result<()> {
    let config = TuringConfig::load()?;
    let bus = Arc::new(TracingBus);
    let metrics = Arc::new(KernelMetrics::new());
    let store = Arc::new(EventStore::new(config.kernel.event_capacity));
    let state = Arc::new(KernelStateMachine::new());

    let mut verifier = PostConditionVerifier::new();
    verifier.register_fn("TRANSFER_FUNDS", "funds_credited", |ctx| {
        if ctx.result.get("credited").and_then(serde_json::Value::as_bool) == Some(true) {
            CheckResult::passed("funds_credited")
        } else {
            CheckResult::critical("funds_credited", "destination account never credited")
        }
    });

    let mut compensation = CompensationRegistry::new();
    compensation.register_fn("REFUND_TRANSFER", |ctx| {
        info!(request_id = %ctx.request_id, "refunding demo transfer");
        CompensationOutcome::success()
    });

    let deps = PipelineDeps {
        contracts: Arc::new(demo_contracts()?),
        store: store.clone(),
        state,
        approvals: Arc::new(ApprovalGate::with_default_timeout(bus.clone())),
        verifier: Arc::new(verifier),
        invariants: Arc::new(InvariantChecker::with_builtins(metrics.clone())),
        compensation: Arc::new(compensation),
        incidents: Arc::new(CompensationIncidentManager::new(bus.clone())),
        handler: Arc::new(DemoHandler),
        bus,
        metrics,
    };
    let pipeline = ToolExecutionPipeline::new(
        deps,
        PipelineConfig {
            max_concurrent: config.kernel.max_concurrent,
            default_timeout_ms: config.kernel.default_timeout_ms,
            auto_approve_read_only: config.kernel.auto_approve_read_only,
            auto_approve_sources: config.kernel.auto_approve_sources.clone(),
        },
    );

    let emote = pipeline
        .execute(
            ProposedToolCall::new(
                "PLAY_EMOTE",
                json!({"emote": "wave"}),
                CallSource::User,
                "demo-emote",
            ),
            CallContext::default(),
        )
        .await;
    info!(
        success = emote.success,
        events = emote.events_appended,
        reward = emote.reward_signal(),
        "read-only autopath finished"
    );

    let transfer = pipeline
        .execute(
            ProposedToolCall::new(
                "TRANSFER_FUNDS",
                json!({"amount": 125.0}),
                CallSource::Llm,
                "demo-transfer",
            ),
            CallContext::default(),
        )
        .await;
    info!(
        success = transfer.success,
        compensated = transfer.compensation.as_ref().is_some_and(|c| c.success),
        "compensated failure finished"
    );

    for request in ["demo-emote", "demo-transfer"] {
        println!("--- events for {request} ---");
        for event in store.get_by_request_id(request) {
            println!(
                "{:>4}  {:<32} {}",
                event.sequence_id,
                event.event_type.to_string(),
                event.payload
            );
        }
    }
    let verdict = store.verify_retained();
    println!(
        "chain valid: {}{}",
        verdict.valid,
        verdict.reason.map(|r| format!(" ({r})")).unwrap_or_default()
    );
    Ok(())
}

async fn run_gate(text: String) -> Result<()> {
    let config = TuringConfig::load()?;
    let bus = Arc::new(TracingBus);
    let metrics = Arc::new(KernelMetrics::new());
    let gate = if config.memory_gate.enabled {
        MemoryGate::new(
            Arc::new(TrustScorer::default()),
            config.memory_gate.to_gate_config(),
            bus,
            metrics,
        )
    } else {
        MemoryGate::disabled(bus, metrics)
    };

    let decision = gate
        .admit(InboundContent::now(text, "cli", SourceKind::User))
        .await;
    match &decision {
        GateDecision::Allow { trust } => println!("allow (score {:.2})", trust.score),
        GateDecision::Quarantine { id, trust, .. } => {
            println!("quarantine {id} (score {:.2})", trust.score);
        }
        GateDecision::Reject { trust, reason } => {
            println!("reject (score {:.2}): {reason}", trust.score);
        }
    }
    if let GateDecision::Quarantine { trust, .. } | GateDecision::Reject { trust, .. } = &decision {
        for line in &trust.reasoning {
            println!("  - {line}");
        }
    }
    Ok(())
}

fn run_verify(path: &str) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    let mut events = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: ExecutionEvent = serde_json::from_str(line)
            .with_context(|| format!("bad event on line {}", index.saturating_add(1)))?;
        events.push(event);
    }

    let verdict = EventStore::verify_chain(&events);
    if verdict.valid {
        println!("ok: {} events, chain intact", events.len());
        Ok(())
    } else {
        anyhow::bail!(
            "chain broken at sequence {:?}: {}",
            verdict.first_invalid_sequence_id,
            verdict.reason.unwrap_or_default()
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    turing::logging::init_cli();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo => run_demo().await,
        Command::Gate { text } => run_gate(text).await,
        Command::Verify { path } => run_verify(&path),
    }
}
