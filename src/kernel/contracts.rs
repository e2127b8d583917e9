//! Tool contracts -- per-tool declarations loaded at init.
//!
//! A [`ToolContract`] is the kernel's whole knowledge of a tool: input and
//! output shape, risk class, approval and trust requirements, rate limit,
//! and the name of its compensation action. Contracts are registered once
//! at startup and the registry is frozen behind an `Arc` for the life of
//! the run.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kernel::validator::ParamSchema;
use crate::types::RiskClass;

/// Default per-tool execution cap in milliseconds.
pub const DEFAULT_MAX_DURATION_MS: u64 = 30_000;

/// Sliding-window rate limit for a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Maximum executions inside the window.
    pub max: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

/// Declaration the kernel enforces for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContract {
    /// Tool name; the registry key.
    pub name: String,
    /// Contract version.
    pub version: semver::Version,
    /// Shape of accepted parameters.
    #[serde(default)]
    pub input_schema: ParamSchema,
    /// Shape of the result (informational; enforced by post-conditions).
    #[serde(default)]
    pub output_schema: ParamSchema,
    /// Declared side-effect class.
    pub risk_class: RiskClass,
    /// Whether execution needs an approval decision.
    pub requires_approval: bool,
    /// Minimum trust score of the triggering content, in [0, 1].
    #[serde(default)]
    pub min_trust_score: f64,
    /// Optional sliding-window rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    /// Execution cap in milliseconds.
    pub max_duration_ms: u64,
    /// Whether repeated execution with the same params is safe.
    #[serde(default)]
    pub idempotent: bool,
    /// Compensation action to run when a reversible execution goes bad.
    #[serde(default)]
    pub compensation_action: Option<String>,
    /// Invariant predicate ids this tool is subject to.
    #[serde(default)]
    pub invariants: Vec<String>,
}

impl ToolContract {
    /// Build a contract with the given risk class and library defaults.
    ///
    /// The version string must be valid semver; invalid input falls back
    /// to `0.0.0` and is rejected later by [`ContractRegistry::register`].
    pub fn new(name: impl Into<String>, version: &str, risk_class: RiskClass) -> Self {
        Self {
            name: name.into(),
            version: semver::Version::parse(version)
                .unwrap_or_else(|_| semver::Version::new(0, 0, 0)),
            input_schema: ParamSchema::default(),
            output_schema: ParamSchema::default(),
            risk_class,
            requires_approval: matches!(risk_class, RiskClass::Irreversible),
            min_trust_score: 0.0,
            rate_limit: None,
            max_duration_ms: DEFAULT_MAX_DURATION_MS,
            idempotent: matches!(risk_class, RiskClass::ReadOnly),
            compensation_action: None,
            invariants: Vec::new(),
        }
    }

    /// Shorthand for a read-only contract.
    pub fn read_only(name: impl Into<String>, version: &str) -> Self {
        Self::new(name, version, RiskClass::ReadOnly)
    }

    /// Shorthand for a reversible contract with its compensation action.
    pub fn reversible(
        name: impl Into<String>,
        version: &str,
        compensation_action: impl Into<String>,
    ) -> Self {
        let mut contract = Self::new(name, version, RiskClass::Reversible);
        contract.compensation_action = Some(compensation_action.into());
        contract
    }

    /// Shorthand for an irreversible contract (approval implied).
    pub fn irreversible(name: impl Into<String>, version: &str) -> Self {
        Self::new(name, version, RiskClass::Irreversible)
    }

    /// Replace the input schema.
    #[must_use]
    pub fn with_input_schema(mut self, schema: ParamSchema) -> Self {
        self.input_schema = schema;
        self
    }

    /// Demand an approval decision before execution.
    #[must_use]
    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Set the minimum trust score.
    #[must_use]
    pub fn with_min_trust(mut self, min: f64) -> Self {
        self.min_trust_score = min.clamp(0.0, 1.0);
        self
    }

    /// Set the rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, max: u32, window_ms: u64) -> Self {
        self.rate_limit = Some(RateLimit { max, window_ms });
        self
    }

    /// Set the execution cap.
    #[must_use]
    pub fn with_max_duration_ms(mut self, ms: u64) -> Self {
        self.max_duration_ms = ms;
        self
    }
}

/// Contract registration failures.
#[derive(Debug, Error)]
pub enum ContractError {
    /// A contract with this name was already registered.
    #[error("contract already registered: {0}")]
    Duplicate(String),
    /// Version did not parse as semver.
    #[error("contract '{name}' has an invalid version")]
    InvalidVersion {
        /// Offending contract name.
        name: String,
    },
    /// Irreversible tools must demand approval.
    #[error("contract '{name}' is irreversible but does not require approval")]
    IrreversibleWithoutApproval {
        /// Offending contract name.
        name: String,
    },
    /// A field pattern failed to compile.
    #[error("contract '{name}' field '{field}' has an invalid pattern: {source}")]
    InvalidPattern {
        /// Offending contract name.
        name: String,
        /// Offending field.
        field: String,
        /// Regex compile error.
        source: regex::Error,
    },
}

/// A contract plus its pre-compiled field patterns.
#[derive(Debug)]
pub struct CompiledContract {
    /// The registered declaration.
    pub contract: ToolContract,
    patterns: HashMap<String, Regex>,
}

impl CompiledContract {
    /// Compiled regex for a field, when the spec declares one.
    pub fn pattern_for(&self, field: &str) -> Option<&Regex> {
        self.patterns.get(field)
    }
}

/// Registry of tool contracts; build once, read many.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, CompiledContract>,
}

impl ContractRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one contract, compiling its field patterns.
    ///
    /// # Errors
    ///
    /// Rejects duplicates, `0.0.0` fallback versions, irreversible
    /// contracts without `requires_approval`, and invalid regexes.
    pub fn register(&mut self, contract: ToolContract) -> Result<(), ContractError> {
        if self.contracts.contains_key(&contract.name) {
            return Err(ContractError::Duplicate(contract.name));
        }
        if contract.version == semver::Version::new(0, 0, 0) {
            return Err(ContractError::InvalidVersion {
                name: contract.name,
            });
        }
        if matches!(contract.risk_class, RiskClass::Irreversible) && !contract.requires_approval {
            return Err(ContractError::IrreversibleWithoutApproval {
                name: contract.name,
            });
        }

        let mut patterns = HashMap::new();
        for (field, spec) in &contract.input_schema.fields {
            if let Some(pattern) = &spec.pattern {
                let regex = Regex::new(pattern).map_err(|source| ContractError::InvalidPattern {
                    name: contract.name.clone(),
                    field: field.clone(),
                    source,
                })?;
                patterns.insert(field.clone(), regex);
            }
        }

        self.contracts
            .insert(contract.name.clone(), CompiledContract { contract, patterns });
        Ok(())
    }

    /// Look up a compiled contract by tool name.
    pub fn get(&self, name: &str) -> Option<&CompiledContract> {
        self.contracts.get(name)
    }

    /// Names of all registered tools.
    pub fn tool_names(&self) -> Vec<&str> {
        self.contracts.keys().map(String::as_str).collect()
    }

    /// Number of registered contracts.
    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}
