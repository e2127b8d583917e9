//! Compensation registry -- pre-declared reverse actions for reversible
//! tools.
//!
//! A reversible tool may not execute unless its compensation action is
//! registered here. The registry never panics and never errors outward:
//! a missing action or a failing compensator is reported in the returned
//! outcome and left for the pipeline to surface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

/// What a compensation action gets to work with.
#[derive(Debug, Clone)]
pub struct CompensationContext {
    /// Tool whose side effects are being reversed.
    pub tool_name: String,
    /// Validated params the tool ran with.
    pub params: serde_json::Map<String, serde_json::Value>,
    /// The tool's result, when execution got that far.
    pub result: Option<serde_json::Value>,
    /// Request being compensated.
    pub request_id: String,
}

/// Result of running a compensation action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationOutcome {
    /// Whether the reverse operation succeeded.
    pub success: bool,
    /// Free-form explanation.
    pub detail: Option<String>,
}

impl CompensationOutcome {
    /// A successful compensation.
    pub fn success() -> Self {
        Self {
            success: true,
            detail: None,
        }
    }

    /// A failed compensation with an explanation.
    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }
}

/// A registered reverse operation.
#[async_trait]
pub trait CompensationAction: Send + Sync {
    /// Undo the tool's side effects. Must not panic; report failure
    /// through the outcome instead.
    async fn compensate(&self, ctx: &CompensationContext) -> CompensationOutcome;
}

/// Closure-backed compensation action.
struct FnAction<F> {
    f: F,
}

#[async_trait]
impl<F> CompensationAction for FnAction<F>
where
    F: Fn(&CompensationContext) -> CompensationOutcome + Send + Sync,
{
    async fn compensate(&self, ctx: &CompensationContext) -> CompensationOutcome {
        (self.f)(ctx)
    }
}

/// Registry of compensation actions, keyed by action name.
#[derive(Default)]
pub struct CompensationRegistry {
    actions: HashMap<String, Arc<dyn CompensationAction>>,
}

impl std::fmt::Debug for CompensationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationRegistry")
            .field("actions", &self.actions.len())
            .finish()
    }
}

impl CompensationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under its name.
    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn CompensationAction>) {
        self.actions.insert(name.into(), action);
    }

    /// Register a synchronous closure as an action.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&CompensationContext) -> CompensationOutcome + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnAction { f }));
    }

    /// Whether an action is registered under this name.
    pub fn has(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Run the named action. Unknown names return a failed outcome
    /// rather than an error.
    pub async fn compensate(&self, name: &str, ctx: &CompensationContext) -> CompensationOutcome {
        let Some(action) = self.actions.get(name) else {
            warn!(
                action = name,
                tool = %ctx.tool_name,
                "compensation action not registered"
            );
            return CompensationOutcome::failure(format!(
                "no compensation action registered under '{name}'"
            ));
        };

        let outcome = action.compensate(ctx).await;
        if outcome.success {
            info!(action = name, tool = %ctx.tool_name, request_id = %ctx.request_id, "compensation succeeded");
        } else {
            warn!(
                action = name,
                tool = %ctx.tool_name,
                request_id = %ctx.request_id,
                detail = outcome.detail.as_deref().unwrap_or("-"),
                "compensation failed"
            );
        }
        outcome
    }
}
