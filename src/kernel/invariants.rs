//! Cross-system invariants -- properties that must hold after every
//! execution.
//!
//! Checks are stateless functions over a snapshot of kernel facts. They
//! are registered once at init; the built-ins cover safe-mode
//! containment, orphaned approvals, and failure-before-error ordering.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::metrics::{InvariantResult, KernelMetrics};
use crate::types::{KernelState, RiskClass};

/// Snapshot of kernel facts an invariant may inspect.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantInput {
    /// Kernel state at check time.
    pub current_state: KernelState,
    /// Approvals still awaiting a decision.
    pub pending_approval_count: usize,
    /// Events appended so far in this run (tracked incrementally).
    pub event_count: u64,
    /// Whether the action handler completed without error.
    pub execution_succeeded: bool,
    /// Whether the handler was actually invoked this run.
    pub execution_attempted: bool,
    /// Risk class of the executed tool.
    pub risk_class: RiskClass,
    /// `approval:requested` events appended this run.
    pub approvals_requested: u64,
    /// `approval:resolved` events appended this run.
    pub approvals_resolved: u64,
    /// Whether a `failed` event was appended this run.
    pub saw_failed_event: bool,
    /// Condensed pipeline outcome for result-shape checks.
    pub pipeline_result: serde_json::Value,
}

/// Outcome of one invariant.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheck {
    /// Invariant name.
    pub name: String,
    /// Whether it held.
    pub passed: bool,
    /// Whether a violation is critical (triggers compensation).
    pub critical: bool,
    /// Explanation when violated.
    pub detail: Option<String>,
}

/// Rolled-up invariant outcome for one run.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantReport {
    /// "pass" or "fail".
    pub status: &'static str,
    /// Every invariant, in registration order.
    pub checks: Vec<InvariantCheck>,
    /// Whether any critical invariant was violated.
    pub has_critical_violation: bool,
}

type InvariantFn = dyn Fn(&InvariantInput) -> Result<(), String> + Send + Sync;

struct RegisteredInvariant {
    name: String,
    critical: bool,
    check: Box<InvariantFn>,
}

/// Registry of cross-system invariants; build once, read many.
pub struct InvariantChecker {
    invariants: Vec<RegisteredInvariant>,
    metrics: Arc<KernelMetrics>,
}

impl std::fmt::Debug for InvariantChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvariantChecker")
            .field("invariants", &self.invariants.len())
            .finish()
    }
}

impl InvariantChecker {
    /// Create an empty checker.
    pub fn new(metrics: Arc<KernelMetrics>) -> Self {
        Self {
            invariants: Vec::new(),
            metrics,
        }
    }

    /// Create a checker pre-loaded with the built-in invariants.
    pub fn with_builtins(metrics: Arc<KernelMetrics>) -> Self {
        let mut checker = Self::new(metrics);

        // Safe mode admits only read-only side effects.
        checker.register("safe_mode_read_only", true, |input| {
            if input.current_state == KernelState::SafeMode
                && input.execution_attempted
                && input.risk_class != RiskClass::ReadOnly
            {
                return Err(format!(
                    "tool with risk class '{}' executed while kernel is in safe_mode",
                    input.risk_class
                ));
            }
            Ok(())
        });

        // Every approval request must be resolved by the time a run ends.
        checker.register("no_orphan_approvals", true, |input| {
            if input.approvals_requested > input.approvals_resolved {
                return Err(format!(
                    "{} approval request(s) without a resolution",
                    input
                        .approvals_requested
                        .saturating_sub(input.approvals_resolved)
                ));
            }
            Ok(())
        });

        // A failed execution must leave a `failed` event behind before the
        // state machine moves out of `executing`.
        checker.register("failure_leaves_evidence", false, |input| {
            if input.execution_attempted && !input.execution_succeeded && !input.saw_failed_event {
                return Err("execution failed but no failed event was appended".to_owned());
            }
            Ok(())
        });

        checker
    }

    /// Register one invariant. `critical` violations trigger the
    /// pipeline's compensation path.
    pub fn register<F>(&mut self, name: impl Into<String>, critical: bool, check: F)
    where
        F: Fn(&InvariantInput) -> Result<(), String> + Send + Sync + 'static,
    {
        self.invariants.push(RegisteredInvariant {
            name: name.into(),
            critical,
            check: Box::new(check),
        });
    }

    /// Evaluate every invariant against a snapshot.
    pub fn check(&self, input: &InvariantInput) -> InvariantReport {
        let mut checks = Vec::with_capacity(self.invariants.len());
        let mut has_critical_violation = false;

        for invariant in &self.invariants {
            match (invariant.check)(input) {
                Ok(()) => checks.push(InvariantCheck {
                    name: invariant.name.clone(),
                    passed: true,
                    critical: invariant.critical,
                    detail: None,
                }),
                Err(detail) => {
                    warn!(
                        invariant = %invariant.name,
                        critical = invariant.critical,
                        detail,
                        "invariant violated"
                    );
                    if invariant.critical {
                        has_critical_violation = true;
                    }
                    checks.push(InvariantCheck {
                        name: invariant.name.clone(),
                        passed: false,
                        critical: invariant.critical,
                        detail: Some(detail),
                    });
                }
            }
        }

        let all_passed = checks.iter().all(|c| c.passed);
        self.metrics.record_invariant_result(if all_passed {
            InvariantResult::Pass
        } else {
            InvariantResult::Fail
        });

        InvariantReport {
            status: if all_passed { "pass" } else { "fail" },
            checks,
            has_critical_violation,
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Whether no invariants are registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}
