//! Record schemas, validation and coercion
//!
//! Validation and coercion are two separate steps:
//!
//! - [`Schema::validate`] checks an already-typed JSON rendering of a record
//!   (type and shape of every field) and reports *every* violation at once.
//! - [`Schema::coerce`] turns untyped string data from the outside world
//!   (for example Kubernetes annotations) into a typed JSON object. It only
//!   runs at that boundary and fails on the first value it cannot convert.

use std::collections::HashMap;
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use super::{parse_timestamp, RecordKind};

/// Prefix marking a structured (JSON) value inside a flat string map
pub const JSON_PREFIX: &str = "json:";

/// Wire type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    StringList,
    /// JSON object with arbitrary values
    Object,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::StringList => "list of strings",
            FieldType::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64(),
            FieldType::StringList => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
            FieldType::Object => value.is_object(),
        }
    }
}

/// Extra checks applied once a field has the right type
#[derive(Debug, Clone, Copy)]
pub enum Constraint {
    /// String must contain something other than whitespace
    NonEmpty,
    /// Integer must be at least this value
    Min(i64),
    /// String must be one of the listed values
    OneOf(&'static [&'static str]),
    /// String must be empty or a parseable timestamp
    Timestamp,
    /// String is passed to a command line: no leading `-`, no whitespace
    /// or control characters
    Argument,
}

/// Description of one field of a record
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    pub constraints: &'static [Constraint],
}

impl FieldSpec {
    pub const fn required(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: true,
            constraints: &[],
        }
    }

    pub const fn optional(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: false,
            constraints: &[],
        }
    }

    pub const fn with(self, constraints: &'static [Constraint]) -> Self {
        Self {
            name: self.name,
            field_type: self.field_type,
            required: self.required,
            constraints,
        }
    }
}

/// The full set of fields of a record kind
#[derive(Debug)]
pub struct Schema {
    pub kind: RecordKind,
    pub fields: &'static [FieldSpec],
}

/// A single offending field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub reason: String,
}

impl Violation {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// A record failed its schema; carries every violation found
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} record failed validation: {}", join_violations(.violations))]
pub struct ValidationError {
    pub kind: RecordKind,
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Names of the offending fields, in schema order
    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Untyped input could not be converted to the field's type
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoercionError {
    #[error("field '{field}' expected {expected}, got '{value}'")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        value: String,
    },
}

impl Schema {
    /// Check every field of `value` against this schema.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        let Some(map) = value.as_object() else {
            return Err(ValidationError {
                kind: self.kind,
                violations: vec![Violation::new(self.kind.as_str(), "expected an object")],
            });
        };

        let mut violations = Vec::new();
        for def in self.fields {
            match map.get(def.name) {
                None | Some(Value::Null) => {
                    if def.required {
                        violations.push(Violation::new(def.name, "missing required field"));
                    }
                }
                Some(field) if !def.field_type.matches(field) => {
                    violations.push(Violation::new(
                        def.name,
                        format!(
                            "expected {}, found {}",
                            def.field_type.name(),
                            json_type_name(field)
                        ),
                    ));
                }
                Some(field) => {
                    for constraint in def.constraints {
                        if let Some(reason) = check_constraint(constraint, field) {
                            violations.push(Violation::new(def.name, reason));
                        }
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                kind: self.kind,
                violations,
            })
        }
    }

    /// Convert a flat string map into a typed JSON object.
    ///
    /// Keys that are not part of the schema are ignored; fields missing from
    /// `raw` are left out so serde defaults apply.
    pub fn coerce(&self, raw: &HashMap<String, String>) -> Result<Value, CoercionError> {
        let mut out = Map::new();
        for def in self.fields {
            let Some(text) = raw.get(def.name) else {
                continue;
            };
            let value = match def.field_type {
                FieldType::String => Value::String(text.clone()),
                FieldType::Integer => text
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| mismatch(def, text))?,
                FieldType::StringList => coerce_list(text).ok_or_else(|| mismatch(def, text))?,
                FieldType::Object => coerce_object(text).ok_or_else(|| mismatch(def, text))?,
            };
            out.insert(def.name.to_string(), value);
        }
        Ok(Value::Object(out))
    }

    /// Flatten a typed JSON object into strings, the inverse of [`Schema::coerce`].
    pub fn flatten(&self, value: &Value) -> HashMap<String, String> {
        let mut out = HashMap::new();
        let Some(map) = value.as_object() else {
            return out;
        };
        for def in self.fields {
            let text = match map.get(def.name) {
                None | Some(Value::Null) => continue,
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(other) => format!("{}{}", JSON_PREFIX, other),
            };
            out.insert(def.name.to_string(), text);
        }
        out
    }
}

fn mismatch(def: &FieldSpec, text: &str) -> CoercionError {
    CoercionError::TypeMismatch {
        field: def.name.to_string(),
        expected: def.field_type.name(),
        value: text.to_string(),
    }
}

fn coerce_list(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return Some(Value::Array(Vec::new()));
    }
    let body = text.strip_prefix(JSON_PREFIX)?;
    let parsed: Value = serde_json::from_str(body).ok()?;
    FieldType::StringList.matches(&parsed).then_some(parsed)
}

fn coerce_object(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return Some(Value::Object(Map::new()));
    }
    let body = text.strip_prefix(JSON_PREFIX)?;
    let parsed: Value = serde_json::from_str(body).ok()?;
    FieldType::Object.matches(&parsed).then_some(parsed)
}

fn check_constraint(constraint: &Constraint, value: &Value) -> Option<String> {
    match constraint {
        Constraint::NonEmpty => match value.as_str() {
            Some(s) if s.trim().is_empty() => Some("must not be empty".to_string()),
            _ => None,
        },
        Constraint::Min(min) => match value.as_i64() {
            Some(n) if n < *min => Some(format!("must be >= {}, got {}", min, n)),
            _ => None,
        },
        Constraint::OneOf(allowed) => match value.as_str() {
            Some(s) if !allowed.contains(&s) => Some(format!(
                "must be one of [{}], got '{}'",
                allowed.join(", "),
                s
            )),
            _ => None,
        },
        Constraint::Timestamp => match value.as_str() {
            Some(s) if !s.is_empty() && parse_timestamp(s).is_none() => {
                Some(format!("'{}' is not a timestamp", s))
            }
            _ => None,
        },
        Constraint::Argument => match value.as_str() {
            Some(s) if s.starts_with('-') => Some(format!("'{}' must not start with '-'", s)),
            Some(s) if s.chars().any(|c| c.is_whitespace() || c.is_control()) => {
                Some(format!("'{}' must not contain whitespace", s))
            }
            _ => None,
        },
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
