//! Kernel metrics -- atomic counters, gauges, and per-stage durations.
//!
//! No exporter dependency: the embedding application reads a
//! [`MetricsSnapshot`] and forwards it to whatever telemetry stack it
//! runs. Counter names follow the `autonomy_*` convention so dashboards
//! stay stable across hosts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Aggregated duration record for one pipeline stage.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageDuration {
    /// Number of recorded runs.
    pub count: u64,
    /// Sum of all durations in milliseconds.
    pub total_ms: u64,
    /// Fastest recorded run.
    pub min_ms: u64,
    /// Slowest recorded run.
    pub max_ms: u64,
}

/// Point-in-time export of every kernel metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// `autonomy_memory_gate_decisions_total{decision="accepted"}`.
    pub memory_gate_accepted: u64,
    /// `autonomy_memory_gate_decisions_total{decision="rejected"}`.
    pub memory_gate_rejected: u64,
    /// `autonomy_quarantine_size` gauge.
    pub quarantine_size: u64,
    /// `autonomy_invariant_checks_total{result="pass"}`.
    pub invariant_pass: u64,
    /// `autonomy_invariant_checks_total{result="fail"}`.
    pub invariant_fail: u64,
    /// `autonomy_invariant_checks_total{result="error"}`.
    pub invariant_error: u64,
    /// Per-stage duration aggregates keyed by stage name.
    pub stage_durations: HashMap<String, StageDuration>,
}

/// Shared metric registry for one kernel instance.
#[derive(Debug, Default)]
pub struct KernelMetrics {
    memory_gate_accepted: AtomicU64,
    memory_gate_rejected: AtomicU64,
    quarantine_size: AtomicU64,
    invariant_pass: AtomicU64,
    invariant_fail: AtomicU64,
    invariant_error: AtomicU64,
    stages: Mutex<HashMap<&'static str, StageDuration>>,
}

impl KernelMetrics {
    /// Create a zeroed registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one memory-gate decision.
    pub fn record_gate_decision(&self, accepted: bool) {
        if accepted {
            self.memory_gate_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.memory_gate_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Set the quarantine-size gauge.
    pub fn set_quarantine_size(&self, size: u64) {
        self.quarantine_size.store(size, Ordering::Relaxed);
    }

    /// Count one invariant-check run by result.
    pub fn record_invariant_result(&self, result: InvariantResult) {
        let counter = match result {
            InvariantResult::Pass => &self.invariant_pass,
            InvariantResult::Fail => &self.invariant_fail,
            InvariantResult::Error => &self.invariant_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one stage duration into the per-stage aggregate.
    pub fn record_stage(&self, stage: &'static str, duration_ms: u64) {
        let mut stages = self
            .stages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = stages.entry(stage).or_default();
        if entry.count == 0 {
            entry.min_ms = duration_ms;
            entry.max_ms = duration_ms;
        } else {
            entry.min_ms = entry.min_ms.min(duration_ms);
            entry.max_ms = entry.max_ms.max(duration_ms);
        }
        entry.count = entry.count.saturating_add(1);
        entry.total_ms = entry.total_ms.saturating_add(duration_ms);
    }

    /// Export every metric at once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages = self
            .stages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(k, v)| ((*k).to_owned(), *v))
            .collect();
        MetricsSnapshot {
            memory_gate_accepted: self.memory_gate_accepted.load(Ordering::Relaxed),
            memory_gate_rejected: self.memory_gate_rejected.load(Ordering::Relaxed),
            quarantine_size: self.quarantine_size.load(Ordering::Relaxed),
            invariant_pass: self.invariant_pass.load(Ordering::Relaxed),
            invariant_fail: self.invariant_fail.load(Ordering::Relaxed),
            invariant_error: self.invariant_error.load(Ordering::Relaxed),
            stage_durations: stages,
        }
    }
}

/// Outcome label for the invariant-check counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantResult {
    /// All invariants held.
    Pass,
    /// At least one invariant was violated.
    Fail,
    /// The checker itself misbehaved.
    Error,
}
