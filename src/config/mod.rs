//! Configuration loading and management.
//!
//! Loads kernel configuration from `./turing.toml` (or `$TURING_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::memory::gate::MemoryGateConfig;
use crate::memory::retriever::RankWeights;
use crate::types::CallSource;
use crate::wake::WakeConfig;

// ── Top-level config ────────────────────────────────────────────

/// Top-level kernel configuration loaded from TOML.
///
/// Path: `./turing.toml` or `$TURING_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TuringConfig {
    /// Pipeline and event-log settings (`[kernel]`).
    pub kernel: KernelSection,
    /// Approval gate settings (`[approval]`).
    pub approval: ApprovalSection,
    /// Memory gate thresholds (`[memory_gate]`).
    pub memory_gate: MemoryGateSection,
    /// Retrieval ranking weights (`[retrieval]`).
    pub retrieval: RetrievalSection,
    /// Wake gate tuning (`[wake]`).
    pub wake: WakeSection,
}

impl TuringConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$TURING_CONFIG_PATH` or `./turing.toml`.
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: TuringConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(TuringConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("TURING_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("turing.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        fn parse_into<T: std::str::FromStr>(target: &mut T, key: &str, value: &str) {
            match value.parse() {
                Ok(parsed) => *target = parsed,
                Err(_) => tracing::warn!(
                    var = key,
                    value,
                    "ignoring invalid env override"
                ),
            }
        }

        if let Some(v) = env("TURING_MAX_CONCURRENT") {
            parse_into(&mut self.kernel.max_concurrent, "TURING_MAX_CONCURRENT", &v);
        }
        if let Some(v) = env("TURING_TOOL_TIMEOUT_MS") {
            parse_into(
                &mut self.kernel.default_timeout_ms,
                "TURING_TOOL_TIMEOUT_MS",
                &v,
            );
        }
        if let Some(v) = env("TURING_EVENT_CAPACITY") {
            parse_into(&mut self.kernel.event_capacity, "TURING_EVENT_CAPACITY", &v);
        }
        if let Some(v) = env("TURING_APPROVAL_TIMEOUT_MS") {
            parse_into(&mut self.approval.timeout_ms, "TURING_APPROVAL_TIMEOUT_MS", &v);
        }
        if let Some(v) = env("TURING_APPROVAL_DB") {
            self.approval.db_path = Some(v);
        }
        if let Some(v) = env("TURING_GATE_WRITE_THRESHOLD") {
            parse_into(
                &mut self.memory_gate.write_threshold,
                "TURING_GATE_WRITE_THRESHOLD",
                &v,
            );
        }
        if let Some(v) = env("TURING_GATE_ENABLED") {
            parse_into(&mut self.memory_gate.enabled, "TURING_GATE_ENABLED", &v);
        }
    }
}

// ── Sections ────────────────────────────────────────────────────

/// `[kernel]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelSection {
    /// Concurrent pipeline runs; excess callers queue FIFO.
    pub max_concurrent: usize,
    /// Fallback per-tool execution cap in milliseconds.
    pub default_timeout_ms: u64,
    /// Event ring capacity.
    pub event_capacity: usize,
    /// Skip approval for read-only tools.
    pub auto_approve_read_only: bool,
    /// Sources whose calls never wait for approval.
    pub auto_approve_sources: Vec<CallSource>,
    /// Boot straight into safe mode (recovery installs).
    pub safe_mode_on_start: bool,
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            default_timeout_ms: 30_000,
            event_capacity: 10_000,
            auto_approve_read_only: true,
            auto_approve_sources: vec![CallSource::System],
            safe_mode_on_start: false,
        }
    }
}

/// `[approval]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    /// Approval TTL in milliseconds.
    pub timeout_ms: u64,
    /// SQLite path for the persistent gate; `None` keeps it in-memory.
    pub db_path: Option<String>,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            db_path: None,
        }
    }
}

/// `[memory_gate]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryGateSection {
    /// Whether the gate runs at all.
    pub enabled: bool,
    /// Score at or above this writes straight through.
    pub write_threshold: f64,
    /// Score at or above this goes to quarantine.
    pub quarantine_threshold: f64,
    /// Quarantine capacity before LRU eviction.
    pub max_quarantine_size: usize,
    /// Suggested review delay handed back with quarantine decisions.
    pub review_after_ms: u64,
}

impl Default for MemoryGateSection {
    fn default() -> Self {
        let defaults = MemoryGateConfig::default();
        Self {
            enabled: true,
            write_threshold: defaults.write_threshold,
            quarantine_threshold: defaults.quarantine_threshold,
            max_quarantine_size: defaults.max_quarantine_size,
            review_after_ms: defaults.review_after_ms,
        }
    }
}

impl MemoryGateSection {
    /// Convert into the gate's own config type.
    pub fn to_gate_config(&self) -> MemoryGateConfig {
        MemoryGateConfig {
            write_threshold: self.write_threshold,
            quarantine_threshold: self.quarantine_threshold,
            max_quarantine_size: self.max_quarantine_size,
            review_after_ms: self.review_after_ms,
        }
    }
}

/// `[retrieval]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    /// Weight on memory trust.
    pub trust_weight: f64,
    /// Weight on recency decay.
    pub recency_weight: f64,
    /// Weight on semantic relevance.
    pub relevance_weight: f64,
    /// Weight on the memory-type boost.
    pub type_weight: f64,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        let defaults = RankWeights::default();
        Self {
            trust_weight: defaults.trust,
            recency_weight: defaults.recency,
            relevance_weight: defaults.relevance,
            type_weight: defaults.type_boost,
        }
    }
}

impl RetrievalSection {
    /// Convert into the retriever's weight type.
    pub fn to_weights(&self) -> RankWeights {
        RankWeights {
            trust: self.trust_weight,
            recency: self.recency_weight,
            relevance: self.relevance_weight,
            type_boost: self.type_weight,
        }
    }
}

/// `[wake]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WakeSection {
    /// Trigger phrases.
    pub triggers: Vec<String>,
    /// Minimum silence after the trigger, in milliseconds.
    pub min_post_trigger_gap_ms: u64,
    /// Minimum command length in characters.
    pub min_command_length: usize,
    /// Whether fuzzy matching is enabled.
    pub fuzzy: bool,
}

impl Default for WakeSection {
    fn default() -> Self {
        let defaults = WakeConfig::default();
        Self {
            triggers: defaults.triggers,
            min_post_trigger_gap_ms: 350,
            min_command_length: defaults.min_command_length,
            fuzzy: defaults.fuzzy,
        }
    }
}

impl WakeSection {
    /// Convert into the wake gate's config type.
    pub fn to_wake_config(&self) -> WakeConfig {
        #[allow(clippy::cast_precision_loss)] // gap values are small
        let gap_secs = self.min_post_trigger_gap_ms as f64 / 1_000.0;
        WakeConfig {
            triggers: self.triggers.clone(),
            min_post_trigger_gap: gap_secs,
            min_command_length: self.min_command_length,
            fuzzy: self.fuzzy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TuringConfig::default();
        assert_eq!(config.kernel.max_concurrent, 1);
        assert_eq!(config.kernel.event_capacity, 10_000);
        assert_eq!(config.approval.timeout_ms, 300_000);
        assert!((config.memory_gate.write_threshold - 0.7).abs() < f64::EPSILON);
        assert!((config.memory_gate.quarantine_threshold - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.memory_gate.max_quarantine_size, 1_000);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_text = r#"
            [kernel]
            max_concurrent = 4

            [approval]
            timeout_ms = 60000

            [wake]
            triggers = ["turing", "hey turing"]
        "#;
        let config: TuringConfig = toml::from_str(toml_text).expect("parse");
        assert_eq!(config.kernel.max_concurrent, 4);
        assert_eq!(config.approval.timeout_ms, 60_000);
        assert_eq!(config.wake.triggers.len(), 2);
        // Untouched sections keep defaults.
        assert_eq!(config.kernel.event_capacity, 10_000);
        assert!((config.retrieval.trust_weight - 0.35).abs() < f64::EPSILON);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = TuringConfig::default();
        config.apply_overrides(|key| match key {
            "TURING_MAX_CONCURRENT" => Some("8".to_owned()),
            "TURING_APPROVAL_DB" => Some("/tmp/approvals.db".to_owned()),
            "TURING_GATE_ENABLED" => Some("false".to_owned()),
            _ => None,
        });
        assert_eq!(config.kernel.max_concurrent, 8);
        assert_eq!(config.approval.db_path.as_deref(), Some("/tmp/approvals.db"));
        assert!(!config.memory_gate.enabled);
    }

    #[test]
    fn test_invalid_env_override_ignored() {
        let mut config = TuringConfig::default();
        config.apply_overrides(|key| match key {
            "TURING_MAX_CONCURRENT" => Some("not-a-number".to_owned()),
            _ => None,
        });
        assert_eq!(config.kernel.max_concurrent, 1, "bad override keeps default");
    }

    #[test]
    fn test_config_path_resolution() {
        let explicit = TuringConfig::config_path_with(|key| {
            (key == "TURING_CONFIG_PATH").then(|| "/etc/turing/custom.toml".to_owned())
        });
        assert_eq!(explicit, PathBuf::from("/etc/turing/custom.toml"));

        let fallback = TuringConfig::config_path_with(|_| None);
        assert_eq!(fallback, PathBuf::from("turing.toml"));
    }

    #[test]
    fn test_section_conversions() {
        let config = TuringConfig::default();
        let gate = config.memory_gate.to_gate_config();
        assert!((gate.write_threshold - 0.7).abs() < f64::EPSILON);

        let weights = config.retrieval.to_weights();
        assert!((weights.relevance - 0.3).abs() < f64::EPSILON);

        let wake = config.wake.to_wake_config();
        assert!((wake.min_post_trigger_gap - 0.35).abs() < f64::EPSILON);
    }
}
