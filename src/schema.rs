//! Declarative payload schemas.
//!
//! A queue type declares which payload fields it expects, their types, whether
//! they are required and what default to fill in when they are absent.
//! Payloads are normalized (defaults applied) before they are validated, so a
//! defaulted field is never reported as missing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Payload mapping as stored in a task document.
pub type Payload = Map<String, Value>;

// ---------------------------------------------------------------------------
// Field rules
// ---------------------------------------------------------------------------

/// The type a payload field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Float,
    /// Integer or float.
    Number,
    Boolean,
    Dict,
    List,
    /// RFC 3339 timestamp string.
    Datetime,
    Any,
}

impl FieldKind {
    /// Does `value` satisfy this kind? `null` never does; nullability is
    /// decided by the field rule.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Float => value.is_f64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Dict => value.is_object(),
            FieldKind::List => value.is_array(),
            FieldKind::Datetime => value
                .as_str()
                .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
            FieldKind::Any => !value.is_null(),
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Dict => "dict",
            FieldKind::List => "list",
            FieldKind::Datetime => "datetime",
            FieldKind::Any => "any",
        };
        write!(f, "{s}")
    }
}

/// Rule for a single payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub nullable: bool,
}

impl FieldRule {
    /// An optional field of the given kind.
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            nullable: false,
        }
    }

    /// A required field of the given kind.
    pub fn required(kind: FieldKind) -> Self {
        Self {
            required: true,
            ..Self::new(kind)
        }
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    fn check(&self, value: &Value) -> Option<FieldError> {
        if value.is_null() {
            return (!self.nullable).then_some(FieldError::Null);
        }
        if self.kind.accepts(value) {
            None
        } else {
            Some(FieldError::WrongType {
                expected: self.kind,
                found: value_kind(value),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a single field failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum FieldError {
    Missing,
    WrongType {
        expected: FieldKind,
        found: &'static str,
    },
    Null,
    Unknown,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldError::Missing => write!(f, "required field is missing"),
            FieldError::WrongType { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            FieldError::Null => write!(f, "null value not allowed"),
            FieldError::Unknown => write!(f, "unknown field"),
        }
    }
}

/// Every field-level failure for one payload, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    fields: BTreeMap<String, Vec<FieldError>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, error: FieldError) {
        self.fields.entry(field.into()).or_default().push(error);
    }

    /// Fold another set of errors in, prefixing each field name.
    pub fn extend_prefixed(&mut self, prefix: &str, other: ValidationErrors) {
        for (field, errors) in other.fields {
            self.fields
                .entry(format!("{prefix}.{field}"))
                .or_default()
                .extend(errors);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of offending fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, field: &str) -> Option<&[FieldError]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[FieldError])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, errors) in &self.fields {
            for error in errors {
                if !first {
                    write!(f, "; ")?;
                }
                first = false;
                write!(f, "{field}: {error}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Field rules for one queue type's payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: BTreeMap<String, FieldRule>,
    allow_unknown: bool,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: BTreeMap<String, FieldRule>) -> Self {
        Self {
            fields,
            allow_unknown: false,
        }
    }

    pub fn field(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(name.into(), rule);
        self
    }

    /// Accept payload fields the schema does not declare.
    pub fn allow_unknown(mut self, allow: bool) -> Self {
        self.allow_unknown = allow;
        self
    }

    pub fn allows_unknown(&self) -> bool {
        self.allow_unknown
    }

    pub fn rule(&self, name: &str) -> Option<&FieldRule> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldRule)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy of `payload` with declared defaults filled in for absent fields.
    pub fn normalize(&self, payload: &Payload) -> Payload {
        let mut out = payload.clone();
        for (name, rule) in &self.fields {
            if let Some(default) = &rule.default {
                if !out.contains_key(name) {
                    out.insert(name.clone(), default.clone());
                }
            }
        }
        out
    }

    /// Check `payload` against every rule, collecting all failures.
    pub fn validate(&self, payload: &Payload) -> std::result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        for (name, rule) in &self.fields {
            match payload.get(name) {
                None if rule.required => errors.push(name, FieldError::Missing),
                None => {}
                Some(value) => {
                    if let Some(err) = rule.check(value) {
                        errors.push(name, err);
                    }
                }
            }
        }

        if !self.allow_unknown {
            for name in payload.keys() {
                if !self.fields.contains_key(name) {
                    errors.push(name, FieldError::Unknown);
                }
            }
        }

        errors.into_result()
    }

    /// Normalize, then validate the normalized payload.
    pub fn normalized(&self, payload: &Payload) -> std::result::Result<Payload, ValidationErrors> {
        let normalized = self.normalize(payload);
        self.validate(&normalized)?;
        Ok(normalized)
    }

    /// Reject schemas whose declared defaults break their own rules.
    pub fn validate_defaults(&self) -> Result<()> {
        for (name, rule) in &self.fields {
            if let Some(default) = &rule.default {
                if let Some(err) = rule.check(default) {
                    return Err(Error::Config(format!(
                        "default for field '{name}' is invalid: {err}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Short type name of a JSON value, for error messages.
fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn task_schema() -> Schema {
        Schema::new()
            .field("key", FieldRule::required(FieldKind::String))
            .field("required_value", FieldRule::required(FieldKind::String))
            .field(
                "default_value",
                FieldRule::new(FieldKind::String).default_value("nope"),
            )
    }

    #[test]
    fn normalize_fills_defaults_only_when_absent() {
        let schema = task_schema();

        let filled = schema.normalize(&payload(json!({"key": "a"})));
        assert_eq!(filled["default_value"], json!("nope"));

        let kept = schema.normalize(&payload(json!({"key": "a", "default_value": "yes"})));
        assert_eq!(kept["default_value"], json!("yes"));
    }

    #[test]
    fn defaulted_required_field_is_not_reported_missing() {
        let schema = Schema::new().field(
            "attempts",
            FieldRule::required(FieldKind::Integer).default_value(0),
        );
        let out = schema.normalized(&Payload::new()).unwrap();
        assert_eq!(out["attempts"], json!(0));
    }

    #[test]
    fn validate_reports_every_failing_field() {
        let schema = task_schema();
        let errors = schema
            .normalized(&payload(json!({"key": 7, "extra": true})))
            .unwrap_err();

        assert_eq!(errors.len(), 3);
        assert_eq!(
            errors.get("key"),
            Some(
                &[FieldError::WrongType {
                    expected: FieldKind::String,
                    found: "integer",
                }][..]
            )
        );
        assert_eq!(errors.get("required_value"), Some(&[FieldError::Missing][..]));
        assert_eq!(errors.get("extra"), Some(&[FieldError::Unknown][..]));
    }

    #[test]
    fn unknown_fields_pass_when_allowed() {
        let schema = task_schema().allow_unknown(true);
        let result =
            schema.normalized(&payload(json!({"key": "a", "required_value": "b", "x": 1})));
        assert!(result.is_ok());
    }

    #[test]
    fn null_rejected_unless_nullable() {
        let schema = Schema::new()
            .field("a", FieldRule::new(FieldKind::String))
            .field("b", FieldRule::new(FieldKind::String).nullable());
        let errors = schema
            .validate(&payload(json!({"a": null, "b": null})))
            .unwrap_err();
        assert_eq!(errors.get("a"), Some(&[FieldError::Null][..]));
        assert!(errors.get("b").is_none());
    }

    #[test]
    fn kinds_accept_expected_values() {
        assert!(FieldKind::Integer.accepts(&json!(3)));
        assert!(!FieldKind::Integer.accepts(&json!(3.5)));
        assert!(FieldKind::Float.accepts(&json!(3.5)));
        assert!(FieldKind::Number.accepts(&json!(3)));
        assert!(FieldKind::Datetime.accepts(&json!("2024-05-01T10:00:00Z")));
        assert!(!FieldKind::Datetime.accepts(&json!("yesterday")));
        assert!(FieldKind::Dict.accepts(&json!({})));
        assert!(FieldKind::List.accepts(&json!([])));
    }

    #[test]
    fn display_lists_all_errors() {
        let errors = task_schema().validate(&Payload::new()).unwrap_err();
        let text = errors.to_string();
        assert!(text.contains("key: required field is missing"));
        assert!(text.contains("required_value: required field is missing"));
    }

    #[test]
    fn invalid_default_is_a_config_error() {
        let schema = Schema::new().field(
            "n",
            FieldRule::new(FieldKind::Integer).default_value("zero"),
        );
        assert!(matches!(schema.validate_defaults(), Err(Error::Config(_))));
        assert!(task_schema().validate_defaults().is_ok());
    }

    #[test]
    fn rule_deserializes_from_toml() {
        let rule: FieldRule = toml::from_str("type = \"string\"\ndefault = \"nope\"").unwrap();
        assert_eq!(rule.kind, FieldKind::String);
        assert!(!rule.required);
        assert_eq!(rule.default, Some(json!("nope")));
    }
}
