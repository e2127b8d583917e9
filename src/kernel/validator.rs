//! Contract schema validation -- the boundary where dynamic params
//! become typed.
//!
//! Contracts declare their input shape as a [`ParamSchema`]: field types,
//! numeric ranges, string bounds, regex patterns, and enumerations. The
//! validator is pure (no I/O, no clock) and reports every violation it
//! finds with a semantic per-field message, not a codec string.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::contracts::{CompiledContract, ContractRegistry};
use crate::types::{ProposedToolCall, RiskClass};

/// Value type a schema field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// UTF-8 string.
    String,
    /// JSON number (integer-only when `integer` is set).
    Number,
    /// JSON boolean.
    Boolean,
    /// Nested JSON object (opaque to the validator).
    Object,
    /// JSON array (opaque to the validator).
    Array,
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::Number => f.write_str("number"),
            Self::Boolean => f.write_str("boolean"),
            Self::Object => f.write_str("object"),
            Self::Array => f.write_str("array"),
        }
    }
}

/// Declarative constraints for one input parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Accepted value type.
    #[serde(rename = "type")]
    pub kind: FieldKind,
    /// Whether the field must be present (when no default is declared).
    #[serde(default)]
    pub required: bool,
    /// Injected when the caller omits the field.
    #[serde(default)]
    pub default: Option<Value>,
    /// Inclusive numeric minimum.
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive numeric maximum.
    #[serde(default)]
    pub max: Option<f64>,
    /// Reject non-integral numbers.
    #[serde(default)]
    pub integer: bool,
    /// Minimum string length in characters.
    #[serde(default)]
    pub min_length: Option<usize>,
    /// Maximum string length in characters.
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Regex the full string must match (compiled at registration).
    #[serde(default)]
    pub pattern: Option<String>,
    /// Closed set of accepted values.
    #[serde(default)]
    pub one_of: Option<Vec<Value>>,
}

impl FieldSpec {
    /// Minimal spec: a required field of the given kind.
    pub fn required(kind: FieldKind) -> Self {
        Self {
            kind,
            required: true,
            default: None,
            min: None,
            max: None,
            integer: false,
            min_length: None,
            max_length: None,
            pattern: None,
            one_of: None,
        }
    }

    /// Minimal spec: an optional field of the given kind.
    pub fn optional(kind: FieldKind) -> Self {
        Self {
            required: false,
            ..Self::required(kind)
        }
    }
}

/// Input shape declared by a tool contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamSchema {
    /// Per-field constraints, keyed by parameter name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    /// Accept parameters not named in `fields` (passed through untouched).
    #[serde(default)]
    pub allow_unknown: bool,
}

/// One semantic validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Parameter the failure refers to ("tool" for registry misses).
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

/// Outcome of validating one proposed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether the call may proceed.
    pub valid: bool,
    /// Every violation found (empty when valid).
    pub errors: Vec<FieldError>,
    /// Params with defaults injected; meaningful only when valid.
    pub validated_params: serde_json::Map<String, Value>,
    /// Risk class from the contract; absent for unknown tools.
    pub risk_class: Option<RiskClass>,
    /// Whether the contract demands approval; false for unknown tools.
    pub requires_approval: bool,
}

/// Pure validator over a frozen contract registry.
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    registry: std::sync::Arc<ContractRegistry>,
}

impl SchemaValidator {
    /// Create a validator over the given registry.
    pub fn new(registry: std::sync::Arc<ContractRegistry>) -> Self {
        Self { registry }
    }

    /// Validate a proposed call against its registered contract.
    pub fn validate(&self, call: &ProposedToolCall) -> ValidationReport {
        let Some(compiled) = self.registry.get(&call.tool) else {
            return ValidationReport {
                valid: false,
                errors: vec![FieldError {
                    field: "tool".to_owned(),
                    message: "unknown tool".to_owned(),
                }],
                validated_params: serde_json::Map::new(),
                risk_class: None,
                requires_approval: false,
            };
        };

        let mut errors = Vec::new();
        let mut validated = serde_json::Map::new();
        let schema = &compiled.contract.input_schema;

        for (name, spec) in &schema.fields {
            match call.params.get(name) {
                Some(value) => {
                    check_field(name, spec, value, compiled, &mut errors);
                    validated.insert(name.clone(), value.clone());
                }
                None => {
                    if let Some(default) = &spec.default {
                        validated.insert(name.clone(), default.clone());
                    } else if spec.required {
                        errors.push(FieldError {
                            field: name.clone(),
                            message: "required field missing".to_owned(),
                        });
                    }
                }
            }
        }

        for name in call.params.keys() {
            if !schema.fields.contains_key(name) {
                if schema.allow_unknown {
                    validated.insert(name.clone(), call.params[name].clone());
                } else {
                    errors.push(FieldError {
                        field: name.clone(),
                        message: "unknown parameter".to_owned(),
                    });
                }
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            validated_params: validated,
            risk_class: Some(compiled.contract.risk_class),
            requires_approval: compiled.contract.requires_approval,
        }
    }
}

/// Check one present value against its spec, appending semantic errors.
fn check_field(
    name: &str,
    spec: &FieldSpec,
    value: &Value,
    compiled: &CompiledContract,
    errors: &mut Vec<FieldError>,
) {
    let type_ok = match spec.kind {
        FieldKind::String => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Object => value.is_object(),
        FieldKind::Array => value.is_array(),
    };
    if !type_ok {
        errors.push(FieldError {
            field: name.to_owned(),
            message: format!("expected a {}", spec.kind),
        });
        return;
    }

    if let Some(allowed) = &spec.one_of {
        if !allowed.contains(value) {
            errors.push(FieldError {
                field: name.to_owned(),
                message: format!("unknown enum value {value}"),
            });
            return;
        }
    }

    match spec.kind {
        FieldKind::Number => {
            let n = value.as_f64().unwrap_or(f64::NAN);
            if spec.integer && n.fract() != 0.0 {
                errors.push(FieldError {
                    field: name.to_owned(),
                    message: "expected an integer".to_owned(),
                });
            }
            if let Some(min) = spec.min {
                if n < min {
                    errors.push(FieldError {
                        field: name.to_owned(),
                        message: format!("below minimum {min}"),
                    });
                }
            }
            if let Some(max) = spec.max {
                if n > max {
                    errors.push(FieldError {
                        field: name.to_owned(),
                        message: format!("above maximum {max}"),
                    });
                }
            }
        }
        FieldKind::String => {
            let s = value.as_str().unwrap_or_default();
            let chars = s.chars().count();
            if let Some(min_len) = spec.min_length {
                if chars < min_len {
                    errors.push(FieldError {
                        field: name.to_owned(),
                        message: format!("shorter than {min_len} characters"),
                    });
                }
            }
            if let Some(max_len) = spec.max_length {
                if chars > max_len {
                    errors.push(FieldError {
                        field: name.to_owned(),
                        message: format!("longer than {max_len} characters"),
                    });
                }
            }
            if spec.pattern.is_some() {
                if let Some(re) = compiled.pattern_for(name) {
                    if !re.is_match(s) {
                        errors.push(FieldError {
                            field: name.to_owned(),
                            message: format!("does not match pattern {}", re.as_str()),
                        });
                    }
                }
            }
        }
        FieldKind::Boolean | FieldKind::Object | FieldKind::Array => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kernel::contracts::{ContractRegistry, ToolContract};
    use crate::types::CallSource;
    use serde_json::json;

    fn registry_with(contract: ToolContract) -> Arc<ContractRegistry> {
        let mut registry = ContractRegistry::new();
        registry.register(contract).expect("register contract");
        Arc::new(registry)
    }

    fn emote_contract() -> ToolContract {
        let mut fields = BTreeMap::new();
        fields.insert(
            "emote".to_owned(),
            FieldSpec {
                one_of: Some(vec![json!("wave"), json!("bow"), json!("dance")]),
                ..FieldSpec::required(FieldKind::String)
            },
        );
        fields.insert(
            "repeat".to_owned(),
            FieldSpec {
                min: Some(1.0),
                max: Some(5.0),
                integer: true,
                default: Some(json!(1)),
                ..FieldSpec::optional(FieldKind::Number)
            },
        );
        ToolContract::read_only("PLAY_EMOTE", "1.0.0").with_input_schema(ParamSchema {
            fields,
            allow_unknown: false,
        })
    }

    fn call(tool: &str, params: Value) -> ProposedToolCall {
        ProposedToolCall::new(tool, params, CallSource::User, "req-1")
    }

    // ── Happy path ──

    #[test]
    fn test_valid_call_passes_and_injects_default() {
        let validator = SchemaValidator::new(registry_with(emote_contract()));
        let report = validator.validate(&call("PLAY_EMOTE", json!({"emote": "wave"})));

        assert!(report.valid, "errors: {:?}", report.errors);
        assert_eq!(report.validated_params["repeat"], json!(1));
        assert_eq!(report.risk_class, Some(RiskClass::ReadOnly));
        assert!(!report.requires_approval);
    }

    // ── Registry miss ──

    #[test]
    fn test_unknown_tool_single_error() {
        let validator = SchemaValidator::new(registry_with(emote_contract()));
        let report = validator.validate(&call("NONEXISTENT_TOOL", json!({})));

        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].field, "tool");
        assert_eq!(report.errors[0].message, "unknown tool");
        assert_eq!(report.risk_class, None);
    }

    // ── Constraint failures ──

    #[test]
    fn test_multiple_errors_reported() {
        let validator = SchemaValidator::new(registry_with(emote_contract()));
        let report = validator.validate(&call(
            "PLAY_EMOTE",
            json!({"emote": "moonwalk", "repeat": 9, "extra": true}),
        ));

        assert!(!report.valid);
        let fields: Vec<&str> = report.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"emote"), "enum violation: {fields:?}");
        assert!(fields.contains(&"repeat"), "range violation: {fields:?}");
        assert!(fields.contains(&"extra"), "unknown param: {fields:?}");
    }

    #[test]
    fn test_semantic_messages() {
        let validator = SchemaValidator::new(registry_with(emote_contract()));
        let report = validator.validate(&call("PLAY_EMOTE", json!({"emote": "moonwalk"})));
        assert_eq!(report.errors[0].message, r#"unknown enum value "moonwalk""#);

        let report = validator.validate(&call("PLAY_EMOTE", json!({"emote": "wave", "repeat": 0})));
        assert_eq!(report.errors[0].message, "below minimum 1");
    }

    #[test]
    fn test_required_field_missing() {
        let validator = SchemaValidator::new(registry_with(emote_contract()));
        let report = validator.validate(&call("PLAY_EMOTE", json!({})));

        assert!(!report.valid);
        assert_eq!(report.errors[0].field, "emote");
        assert_eq!(report.errors[0].message, "required field missing");
    }

    #[test]
    fn test_type_mismatch() {
        let validator = SchemaValidator::new(registry_with(emote_contract()));
        let report = validator.validate(&call("PLAY_EMOTE", json!({"emote": 42})));

        assert!(!report.valid);
        assert_eq!(report.errors[0].message, "expected a string");
    }

    #[test]
    fn test_non_integer_rejected() {
        let validator = SchemaValidator::new(registry_with(emote_contract()));
        let report =
            validator.validate(&call("PLAY_EMOTE", json!({"emote": "wave", "repeat": 1.5})));

        assert!(!report.valid);
        assert_eq!(report.errors[0].message, "expected an integer");
    }

    // ── Pattern matching ──

    #[test]
    fn test_pattern_constraint() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "account".to_owned(),
            FieldSpec {
                pattern: Some("^acct-[0-9]{4}$".to_owned()),
                ..FieldSpec::required(FieldKind::String)
            },
        );
        let contract = ToolContract::read_only("LOOKUP", "1.0.0").with_input_schema(ParamSchema {
            fields,
            allow_unknown: false,
        });
        let validator = SchemaValidator::new(registry_with(contract));

        let ok = validator.validate(&call("LOOKUP", json!({"account": "acct-0042"})));
        assert!(ok.valid, "errors: {:?}", ok.errors);

        let bad = validator.validate(&call("LOOKUP", json!({"account": "0042"})));
        assert!(!bad.valid);
        assert!(bad.errors[0].message.contains("does not match pattern"));
    }

    // ── Unknown params allowed ──

    #[test]
    fn test_allow_unknown_passes_through() {
        let contract = ToolContract::read_only("FREEFORM", "1.0.0").with_input_schema(ParamSchema {
            fields: BTreeMap::new(),
            allow_unknown: true,
        });
        let validator = SchemaValidator::new(registry_with(contract));
        let report = validator.validate(&call("FREEFORM", json!({"anything": [1, 2]})));

        assert!(report.valid);
        assert_eq!(report.validated_params["anything"], json!([1, 2]));
    }
}
