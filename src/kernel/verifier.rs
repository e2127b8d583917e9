//! Post-condition verification -- checks that run over a completed tool
//! result.
//!
//! Consumers register named checks per tool at init. Checks are async so
//! LLM-backed verification fits behind the same interface; every check
//! runs under a hard time cap and a timed-out check reports as a failed
//! critical check rather than hanging the pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Hard cap for a single check (LLM-backed ones included).
pub const CHECK_TIME_CAP: Duration = Duration::from_secs(5);

/// Outcome status of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// The post-condition held.
    Passed,
    /// The post-condition did not hold.
    Failed,
    /// The post-condition held only marginally.
    Warning,
}

/// How serious a failed check is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Advisory only.
    Info,
    /// Worth operator attention.
    Warning,
    /// Triggers the compensation path.
    Critical,
}

/// Result of a single registered check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name, as registered.
    pub name: String,
    /// Whether the condition held.
    pub status: CheckStatus,
    /// Severity of a failure.
    pub severity: Severity,
    /// Free-form explanation.
    pub detail: Option<String>,
    /// Classification bucket for downstream failure analytics.
    pub failure_taxonomy: Option<String>,
}

impl CheckResult {
    /// A passing result.
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Passed,
            severity: Severity::Info,
            detail: None,
            failure_taxonomy: None,
        }
    }

    /// A critical failure with a detail message.
    pub fn critical(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Failed,
            severity: Severity::Critical,
            detail: Some(detail.into()),
            failure_taxonomy: None,
        }
    }

    /// A non-critical warning.
    pub fn warning(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warning,
            severity: Severity::Warning,
            detail: Some(detail.into()),
            failure_taxonomy: None,
        }
    }

    /// Attach a failure-taxonomy bucket.
    #[must_use]
    pub fn with_taxonomy(mut self, taxonomy: impl Into<String>) -> Self {
        self.failure_taxonomy = Some(taxonomy.into());
        self
    }
}

/// What a check gets to look at.
#[derive(Debug, Clone)]
pub struct VerificationContext {
    /// Tool whose result is being verified.
    pub tool_name: String,
    /// Validated params the handler ran with.
    pub params: serde_json::Map<String, serde_json::Value>,
    /// The handler's result.
    pub result: serde_json::Value,
    /// Request the result belongs to.
    pub request_id: String,
}

/// One registered post-condition.
#[async_trait]
pub trait PostCondition: Send + Sync {
    /// Check name (stable across runs; used in reports).
    fn name(&self) -> &str;

    /// Evaluate the condition against a completed result.
    async fn check(&self, ctx: &VerificationContext) -> CheckResult;
}

/// Closure-backed post-condition for simple registrations.
struct FnCheck<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> PostCondition for FnCheck<F>
where
    F: Fn(&VerificationContext) -> CheckResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, ctx: &VerificationContext) -> CheckResult {
        (self.f)(ctx)
    }
}

/// Rolled-up verification outcome for one tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Aggregate status: failed > warning > passed.
    pub status: CheckStatus,
    /// Every check result, in registration order.
    pub checks: Vec<CheckResult>,
    /// Whether any check failed at critical severity.
    pub has_critical_failure: bool,
}

impl VerificationReport {
    /// Report for a tool with no registered checks.
    pub fn empty() -> Self {
        Self {
            status: CheckStatus::Passed,
            checks: Vec::new(),
            has_critical_failure: false,
        }
    }
}

/// Registry of post-conditions, keyed by tool name.
pub struct PostConditionVerifier {
    checks: HashMap<String, Vec<Arc<dyn PostCondition>>>,
    time_cap: Duration,
}

impl Default for PostConditionVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PostConditionVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostConditionVerifier")
            .field("tools", &self.checks.len())
            .finish()
    }
}

impl PostConditionVerifier {
    /// Create an empty verifier with the default time cap.
    pub fn new() -> Self {
        Self {
            checks: HashMap::new(),
            time_cap: CHECK_TIME_CAP,
        }
    }

    /// Override the per-check time cap (tests use short caps).
    #[must_use]
    pub fn with_time_cap(mut self, cap: Duration) -> Self {
        self.time_cap = cap;
        self
    }

    /// Register a check for a tool.
    pub fn register(&mut self, tool: impl Into<String>, check: Arc<dyn PostCondition>) {
        self.checks.entry(tool.into()).or_default().push(check);
    }

    /// Register a synchronous closure as a check.
    pub fn register_fn<F>(&mut self, tool: impl Into<String>, name: impl Into<String>, f: F)
    where
        F: Fn(&VerificationContext) -> CheckResult + Send + Sync + 'static,
    {
        self.register(
            tool,
            Arc::new(FnCheck {
                name: name.into(),
                f,
            }),
        );
    }

    /// Run every registered check for the tool and roll up the outcome.
    pub async fn verify(&self, ctx: &VerificationContext) -> VerificationReport {
        let Some(checks) = self.checks.get(&ctx.tool_name) else {
            return VerificationReport::empty();
        };

        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            let result = match tokio::time::timeout(self.time_cap, check.check(ctx)).await {
                Ok(result) => result,
                Err(_elapsed) => CheckResult::critical(
                    check.name(),
                    format!("check timed out after {}ms", self.time_cap.as_millis()),
                )
                .with_taxonomy("verifier-timeout"),
            };
            debug!(
                tool = %ctx.tool_name,
                check = %result.name,
                status = ?result.status,
                "post-condition evaluated"
            );
            results.push(result);
        }

        let has_critical_failure = results
            .iter()
            .any(|r| r.status == CheckStatus::Failed && r.severity == Severity::Critical);
        let status = if results.iter().any(|r| r.status == CheckStatus::Failed) {
            CheckStatus::Failed
        } else if results.iter().any(|r| r.status == CheckStatus::Warning) {
            CheckStatus::Warning
        } else {
            CheckStatus::Passed
        };

        VerificationReport {
            status,
            checks: results,
            has_critical_failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(tool: &str, result: serde_json::Value) -> VerificationContext {
        VerificationContext {
            tool_name: tool.to_owned(),
            params: serde_json::Map::new(),
            result,
            request_id: "req-1".to_owned(),
        }
    }

    #[tokio::test]
    async fn test_no_checks_passes() {
        let verifier = PostConditionVerifier::new();
        let report = verifier.verify(&ctx("UNCHECKED", json!({}))).await;
        assert_eq!(report.status, CheckStatus::Passed);
        assert!(!report.has_critical_failure);
        assert!(report.checks.is_empty());
    }

    #[tokio::test]
    async fn test_all_passing() {
        let mut verifier = PostConditionVerifier::new();
        verifier.register_fn("TRANSFER_FUNDS", "balance_non_negative", |_ctx| {
            CheckResult::passed("balance_non_negative")
        });
        verifier.register_fn("TRANSFER_FUNDS", "ledger_consistent", |_ctx| {
            CheckResult::passed("ledger_consistent")
        });

        let report = verifier.verify(&ctx("TRANSFER_FUNDS", json!({}))).await;
        assert_eq!(report.status, CheckStatus::Passed);
        assert_eq!(report.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_critical_failure_rollup() {
        let mut verifier = PostConditionVerifier::new();
        verifier.register_fn("TRANSFER_FUNDS", "balance_non_negative", |ctx| {
            let balance = ctx.result.get("balance").and_then(|v| v.as_f64());
            match balance {
                Some(b) if b >= 0.0 => CheckResult::passed("balance_non_negative"),
                _ => CheckResult::critical("balance_non_negative", "balance went negative")
                    .with_taxonomy("funds-integrity"),
            }
        });

        let report = verifier
            .verify(&ctx("TRANSFER_FUNDS", json!({"balance": -12.5})))
            .await;
        assert_eq!(report.status, CheckStatus::Failed);
        assert!(report.has_critical_failure);
        assert_eq!(
            report.checks[0].failure_taxonomy.as_deref(),
            Some("funds-integrity")
        );
    }

    #[tokio::test]
    async fn test_warning_is_not_critical() {
        let mut verifier = PostConditionVerifier::new();
        verifier.register_fn("PLAY_EMOTE", "latency_budget", |_ctx| {
            CheckResult::warning("latency_budget", "slow but within tolerance")
        });

        let report = verifier.verify(&ctx("PLAY_EMOTE", json!({}))).await;
        assert_eq!(report.status, CheckStatus::Warning);
        assert!(!report.has_critical_failure);
    }

    #[tokio::test]
    async fn test_failed_noncritical_fails_aggregate_only() {
        let mut verifier = PostConditionVerifier::new();
        verifier.register_fn("PLAY_EMOTE", "animation_loaded", |_ctx| CheckResult {
            name: "animation_loaded".to_owned(),
            status: CheckStatus::Failed,
            severity: Severity::Warning,
            detail: None,
            failure_taxonomy: None,
        });

        let report = verifier.verify(&ctx("PLAY_EMOTE", json!({}))).await;
        assert_eq!(report.status, CheckStatus::Failed);
        assert!(
            !report.has_critical_failure,
            "failed + non-critical must not trip the compensation path"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_check_times_out_as_critical() {
        struct SlowCheck;

        #[async_trait]
        impl PostCondition for SlowCheck {
            fn name(&self) -> &str {
                "slow_llm_judgement"
            }

            async fn check(&self, _ctx: &VerificationContext) -> CheckResult {
                tokio::time::sleep(Duration::from_secs(60)).await;
                CheckResult::passed("slow_llm_judgement")
            }
        }

        let mut verifier = PostConditionVerifier::new();
        verifier.register("SUMMARIZE", Arc::new(SlowCheck));

        let report = verifier.verify(&ctx("SUMMARIZE", json!({}))).await;
        assert!(report.has_critical_failure);
        assert_eq!(
            report.checks[0].failure_taxonomy.as_deref(),
            Some("verifier-timeout")
        );
    }
}
