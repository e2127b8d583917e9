//! Kernel state machine -- the closed set of legal lifecycle transitions.
//!
//! State is held in-memory, one instance per runtime, and only this
//! module mutates it. A rejected trigger never changes state; every
//! attempt (accepted or not) is retained in a bounded history for audit.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::{KernelState, KernelTrigger};

/// How many transition attempts the audit history retains.
const HISTORY_CAPACITY: usize = 256;

/// Outcome of one transition attempt.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    /// Whether the trigger was accepted.
    pub accepted: bool,
    /// State before the attempt.
    pub from: KernelState,
    /// State after the attempt (equals `from` when rejected).
    pub to: KernelState,
    /// The trigger that was attempted.
    pub trigger: KernelTrigger,
    /// Why the trigger was rejected, when it was.
    pub reason: Option<String>,
}

/// One retained history entry.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    /// The attempt's outcome.
    pub outcome: TransitionOutcome,
    /// When the attempt happened.
    pub at: DateTime<Utc>,
}

struct MachineInner {
    state: KernelState,
    history: VecDeque<TransitionRecord>,
}

/// Serialized guard over the kernel-wide state.
pub struct KernelStateMachine {
    inner: Mutex<MachineInner>,
}

impl std::fmt::Debug for KernelStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelStateMachine")
            .field("state", &self.current())
            .finish()
    }
}

impl Default for KernelStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the target state for a trigger, or `None` when illegal.
fn target_for(state: KernelState, trigger: KernelTrigger) -> Option<KernelState> {
    use KernelState as S;
    use KernelTrigger as T;

    // Any-state triggers first.
    match trigger {
        T::EnterSafeMode => return Some(S::SafeMode),
        T::FatalError => return Some(S::Error),
        _ => {}
    }

    match (state, trigger) {
        (S::Idle, T::ToolValidated) => Some(S::Executing),
        (S::Idle, T::ApprovalRequired) => Some(S::AwaitingApproval),
        (S::AwaitingApproval, T::ApprovalGranted) => Some(S::Executing),
        (S::AwaitingApproval, T::ApprovalDenied | T::ApprovalExpired) => Some(S::Idle),
        (S::Executing, T::ExecutionComplete) => Some(S::Verifying),
        (S::Verifying, T::VerificationPassed) => Some(S::WritingMemory),
        (S::Verifying, T::VerificationFailed) => Some(S::Error),
        (S::WritingMemory, T::MemoryWritten) => Some(S::Auditing),
        (S::Auditing, T::AuditComplete) => Some(S::Idle),
        (S::Error, T::Recover) => Some(S::Idle),
        (S::SafeMode, T::ExitSafeMode { approved: true }) => Some(S::Idle),
        _ => None,
    }
}

impl KernelStateMachine {
    /// Create a machine in `idle`.
    pub fn new() -> Self {
        Self::starting_in(KernelState::Idle)
    }

    /// Create a machine in an explicit state (e.g. `safe_mode` on boot
    /// after an unclean shutdown).
    pub fn starting_in(state: KernelState) -> Self {
        Self {
            inner: Mutex::new(MachineInner {
                state,
                history: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MachineInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current kernel state.
    pub fn current(&self) -> KernelState {
        self.lock().state
    }

    /// Attempt one transition. Rejected triggers leave state unchanged.
    pub fn transition(&self, trigger: KernelTrigger) -> TransitionOutcome {
        let mut inner = self.lock();
        let from = inner.state;

        let outcome = match target_for(from, trigger) {
            Some(to) => {
                inner.state = to;
                debug!(%from, %to, %trigger, "state transition");
                TransitionOutcome {
                    accepted: true,
                    from,
                    to,
                    trigger,
                    reason: None,
                }
            }
            None => {
                let reason = if matches!(trigger, KernelTrigger::ExitSafeMode { approved: false }) {
                    format!("trigger '{trigger}' requires approval")
                } else {
                    format!("trigger '{trigger}' is illegal in state '{from}'")
                };
                warn!(%from, %trigger, reason, "state transition rejected");
                TransitionOutcome {
                    accepted: false,
                    from,
                    to: from,
                    trigger,
                    reason: Some(reason),
                }
            }
        };

        if inner.history.len() >= HISTORY_CAPACITY {
            inner.history.pop_front();
        }
        inner.history.push_back(TransitionRecord {
            outcome: outcome.clone(),
            at: Utc::now(),
        });
        outcome
    }

    /// Retained transition attempts, oldest first.
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.lock().history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(state: KernelState) -> KernelStateMachine {
        KernelStateMachine::starting_in(state)
    }

    // ── Legal paths ──

    #[test]
    fn test_full_success_cycle() {
        let sm = KernelStateMachine::new();
        for (trigger, expected) in [
            (KernelTrigger::ToolValidated, KernelState::Executing),
            (KernelTrigger::ExecutionComplete, KernelState::Verifying),
            (KernelTrigger::VerificationPassed, KernelState::WritingMemory),
            (KernelTrigger::MemoryWritten, KernelState::Auditing),
            (KernelTrigger::AuditComplete, KernelState::Idle),
        ] {
            let outcome = sm.transition(trigger);
            assert!(outcome.accepted, "trigger {trigger} should be accepted");
            assert_eq!(outcome.to, expected);
        }
        assert_eq!(sm.current(), KernelState::Idle);
    }

    #[test]
    fn test_approval_detour() {
        let sm = KernelStateMachine::new();
        assert!(sm.transition(KernelTrigger::ApprovalRequired).accepted);
        assert_eq!(sm.current(), KernelState::AwaitingApproval);
        assert!(sm.transition(KernelTrigger::ApprovalGranted).accepted);
        assert_eq!(sm.current(), KernelState::Executing);
    }

    #[test]
    fn test_denial_and_expiry_return_to_idle() {
        for trigger in [KernelTrigger::ApprovalDenied, KernelTrigger::ApprovalExpired] {
            let sm = machine_in(KernelState::AwaitingApproval);
            assert!(sm.transition(trigger).accepted);
            assert_eq!(sm.current(), KernelState::Idle);
        }
    }

    #[test]
    fn test_error_recovery() {
        let sm = machine_in(KernelState::Executing);
        assert!(sm.transition(KernelTrigger::FatalError).accepted);
        assert_eq!(sm.current(), KernelState::Error);
        assert!(sm.transition(KernelTrigger::Recover).accepted);
        assert_eq!(sm.current(), KernelState::Idle);
    }

    // ── Safe mode ──

    #[test]
    fn test_safe_mode_from_any_state() {
        for state in [
            KernelState::Idle,
            KernelState::Executing,
            KernelState::Verifying,
            KernelState::AwaitingApproval,
            KernelState::Error,
        ] {
            let sm = machine_in(state);
            assert!(sm.transition(KernelTrigger::EnterSafeMode).accepted);
            assert_eq!(sm.current(), KernelState::SafeMode);
        }
    }

    #[test]
    fn test_safe_mode_exit_requires_approval() {
        let sm = machine_in(KernelState::SafeMode);

        let refused = sm.transition(KernelTrigger::ExitSafeMode { approved: false });
        assert!(!refused.accepted);
        assert_eq!(sm.current(), KernelState::SafeMode);
        assert!(
            refused.reason.is_some_and(|r| r.contains("approval")),
            "rejection should name the missing approval"
        );

        let allowed = sm.transition(KernelTrigger::ExitSafeMode { approved: true });
        assert!(allowed.accepted);
        assert_eq!(sm.current(), KernelState::Idle);
    }

    // ── Rejections ──

    #[test]
    fn test_rejected_trigger_keeps_state() {
        let sm = KernelStateMachine::new();
        let outcome = sm.transition(KernelTrigger::ExecutionComplete);
        assert!(!outcome.accepted);
        assert_eq!(outcome.from, KernelState::Idle);
        assert_eq!(outcome.to, KernelState::Idle);
        assert_eq!(sm.current(), KernelState::Idle);
    }

    #[test]
    fn test_every_trigger_rejected_from_wrong_state_is_noop() {
        // Totality: from `verifying`, everything except the legal triggers
        // and the any-state ones must leave state unchanged.
        let illegal = [
            KernelTrigger::ToolValidated,
            KernelTrigger::ApprovalRequired,
            KernelTrigger::ApprovalGranted,
            KernelTrigger::ApprovalDenied,
            KernelTrigger::ApprovalExpired,
            KernelTrigger::ExecutionComplete,
            KernelTrigger::MemoryWritten,
            KernelTrigger::AuditComplete,
            KernelTrigger::Recover,
            KernelTrigger::ExitSafeMode { approved: true },
        ];
        for trigger in illegal {
            let sm = machine_in(KernelState::Verifying);
            let outcome = sm.transition(trigger);
            assert!(!outcome.accepted, "{trigger} must be rejected");
            assert_eq!(sm.current(), KernelState::Verifying);
        }
    }

    // ── History ──

    #[test]
    fn test_history_records_rejections_too() {
        let sm = KernelStateMachine::new();
        sm.transition(KernelTrigger::ToolValidated);
        sm.transition(KernelTrigger::ToolValidated); // illegal from executing

        let history = sm.history();
        assert_eq!(history.len(), 2);
        assert!(history[0].outcome.accepted);
        assert!(!history[1].outcome.accepted);
    }

    #[test]
    fn test_history_bounded() {
        let sm = KernelStateMachine::new();
        for _ in 0..300 {
            sm.transition(KernelTrigger::Recover); // always rejected from idle
        }
        assert_eq!(sm.history().len(), HISTORY_CAPACITY);
    }
}
