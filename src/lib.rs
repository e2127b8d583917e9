//! Turing -- an autonomy kernel for agent runtimes.
//!
//! A guarded execution pipeline takes a proposed tool call (from an LLM
//! planner, a user, or the runtime itself) and drives it through schema
//! validation, approval routing, execution, post-condition verification,
//! cross-system invariant checking, and compensation -- emitting a
//! hash-chained event per stage and holding a kernel-wide state machine
//! consistent throughout. A trust-scored memory gate and a trust-aware
//! retriever guard what the agent remembers and recalls, and an optional
//! wake gate turns timed ASR tokens into commands.
//!
//! Transports, concrete tools, and LLM calls stay outside: they plug in
//! through the [`kernel::pipeline::ActionHandler`], [`bus::EventBus`],
//! and memory provider traits.

pub mod bus;
pub mod config;
/// Guarded execution pipeline: schema validation, approvals, execution,
/// verification, invariants, and compensation.
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod metrics;
/// Shared domain types used across the kernel, bus, and memory modules.
pub mod types;
pub mod wake;
