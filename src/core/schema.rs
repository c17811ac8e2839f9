//! Structural validation of agent payloads.
//!
//! Supports the JSON Schema subset process files declare for task outputs:
//! `type`, `required`, `properties`, `additionalProperties`, `items`, `enum`,
//! `const`, `minItems`/`maxItems`, `minLength`/`maxLength` and
//! `minimum`/`maximum`. Unknown keywords are ignored.
//!
//! The schema is checked for well-formedness before any payload is looked at,
//! so a broken schema is always reported as [`SchemaError`] and never as a
//! list of violations. Validation itself is a bounded walk over the payload
//! and cannot fail.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const ROOT: &str = "$";
const TYPE_NAMES: [&str; 7] = ["string", "number", "integer", "boolean", "object", "array", "null"];

/// A single place where the payload breaks the contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Dotted path with bracketed indices, e.g. `files[2].path`; `$` is the root
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Join violations for an error message
pub fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The schema itself is malformed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("schema at {path} must be an object or a boolean")]
    NotASchema { path: String },

    #[error("unknown type '{name}' at {path}")]
    UnknownType { path: String, name: String },

    #[error("keyword '{keyword}' at {path} must be {expected}")]
    InvalidKeyword {
        path: String,
        keyword: String,
        expected: &'static str,
    },
}

/// Validate `payload` against `schema`.
///
/// Returns the list of violations; an empty list means the payload conforms.
pub fn validate(payload: &Value, schema: &Value) -> Result<Vec<Violation>, SchemaError> {
    check_schema(schema)?;

    let mut violations = Vec::new();
    validate_node(payload, schema, ROOT, &mut violations);
    Ok(violations)
}

/// Check that a schema is well-formed without validating any payload
pub fn check_schema(schema: &Value) -> Result<(), SchemaError> {
    check_node(schema, ROOT)
}

fn child_path(parent: &str, key: &str) -> String {
    if parent == ROOT {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn index_path(parent: &str, index: usize) -> String {
    format!("{}[{}]", parent, index)
}

fn invalid(path: &str, keyword: &str, expected: &'static str) -> SchemaError {
    SchemaError::InvalidKeyword {
        path: path.to_string(),
        keyword: keyword.to_string(),
        expected,
    }
}

fn check_node(schema: &Value, path: &str) -> Result<(), SchemaError> {
    let obj = match schema {
        Value::Bool(_) => return Ok(()),
        Value::Object(obj) => obj,
        _ => {
            return Err(SchemaError::NotASchema {
                path: path.to_string(),
            })
        }
    };

    if let Some(ty) = obj.get("type") {
        let names: Vec<&Value> = match ty {
            Value::String(_) => vec![ty],
            Value::Array(items) if !items.is_empty() => items.iter().collect(),
            _ => return Err(invalid(path, "type", "a type name or a non-empty list of type names")),
        };
        for name in names {
            let name = name
                .as_str()
                .ok_or_else(|| invalid(path, "type", "a type name or a non-empty list of type names"))?;
            if !TYPE_NAMES.contains(&name) {
                return Err(SchemaError::UnknownType {
                    path: path.to_string(),
                    name: name.to_string(),
                });
            }
        }
    }

    if let Some(required) = obj.get("required") {
        let ok = required
            .as_array()
            .map(|items| items.iter().all(Value::is_string))
            .unwrap_or(false);
        if !ok {
            return Err(invalid(path, "required", "a list of field names"));
        }
    }

    if let Some(values) = obj.get("enum") {
        if !values.is_array() {
            return Err(invalid(path, "enum", "a list of values"));
        }
    }

    if let Some(properties) = obj.get("properties") {
        let properties = properties
            .as_object()
            .ok_or_else(|| invalid(path, "properties", "an object of schemas"))?;
        for (name, sub) in properties {
            check_node(sub, &child_path(path, name))?;
        }
    }

    if let Some(additional) = obj.get("additionalProperties") {
        check_node(additional, &child_path(path, "*"))?;
    }

    match obj.get("items") {
        None => {}
        Some(Value::Array(tuple)) => {
            for (i, sub) in tuple.iter().enumerate() {
                check_node(sub, &index_path(path, i))?;
            }
        }
        Some(items) => check_node(items, &format!("{}[]", path))?,
    }

    for keyword in ["minItems", "maxItems", "minLength", "maxLength"] {
        if let Some(v) = obj.get(keyword) {
            if v.as_u64().is_none() {
                return Err(invalid(path, keyword, "a non-negative integer"));
            }
        }
    }

    for keyword in ["minimum", "maximum"] {
        if let Some(v) = obj.get(keyword) {
            if !v.is_number() {
                return Err(invalid(path, keyword, "a number"));
            }
        }
    }

    Ok(())
}

/// Name of a payload's JSON type, as used in messages
fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_integral(value: &Value) -> bool {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => true,
        Value::Number(n) => n.as_f64().map(|f| f.is_finite() && f.fract() == 0.0).unwrap_or(false),
        _ => false,
    }
}

fn matches_type(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => is_integral(value),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => false,
    }
}

fn validate_node(value: &Value, schema: &Value, path: &str, out: &mut Vec<Violation>) {
    let obj = match schema {
        Value::Bool(true) => return,
        Value::Bool(false) => {
            out.push(Violation::new(path, "no value is allowed here"));
            return;
        }
        Value::Object(obj) => obj,
        _ => return,
    };

    if let Some(ty) = obj.get("type") {
        let names: Vec<&str> = match ty {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !names.iter().any(|name| matches_type(name, value)) {
            out.push(Violation::new(
                path,
                format!("expected {}, found {}", names.join(" or "), type_of(value)),
            ));
            // Structural keywords are meaningless on the wrong type
            return;
        }
    }

    if let Some(Value::Array(allowed)) = obj.get("enum") {
        if !allowed.contains(value) {
            let listed = allowed.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
            out.push(Violation::new(path, format!("value {} is not one of [{}]", value, listed)));
        }
    }

    if let Some(expected) = obj.get("const") {
        if expected != value {
            out.push(Violation::new(path, format!("expected constant {}", expected)));
        }
    }

    match value {
        Value::Object(fields) => validate_object(fields, obj, path, out),
        Value::Array(items) => validate_array(items, obj, path, out),
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = obj.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    out.push(Violation::new(path, format!("length {} is below minLength {}", len, min)));
                }
            }
            if let Some(max) = obj.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    out.push(Violation::new(path, format!("length {} exceeds maxLength {}", len, max)));
                }
            }
        }
        Value::Number(n) => {
            let Some(actual) = n.as_f64() else { return };
            if let Some(min) = obj.get("minimum").and_then(Value::as_f64) {
                if actual < min {
                    out.push(Violation::new(path, format!("{} is below minimum {}", n, min)));
                }
            }
            if let Some(max) = obj.get("maximum").and_then(Value::as_f64) {
                if actual > max {
                    out.push(Violation::new(path, format!("{} exceeds maximum {}", n, max)));
                }
            }
        }
        Value::Null | Value::Bool(_) => {}
    }
}

fn validate_object(
    fields: &Map<String, Value>,
    schema: &Map<String, Value>,
    path: &str,
    out: &mut Vec<Violation>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(name) {
                out.push(Violation::new(child_path(path, name), "required field is missing"));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);

    for (name, field) in fields {
        let field_path = child_path(path, name);
        match properties.and_then(|p| p.get(name)) {
            Some(sub) => validate_node(field, sub, &field_path, out),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    out.push(Violation::new(field_path, "additional field is not allowed"));
                }
                Some(sub @ Value::Object(_)) => validate_node(field, sub, &field_path, out),
                _ => {}
            },
        }
    }
}

fn validate_array(items: &[Value], schema: &Map<String, Value>, path: &str, out: &mut Vec<Violation>) {
    let len = items.len() as u64;
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if len < min {
            out.push(Violation::new(path, format!("{} items is below minItems {}", len, min)));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if len > max {
            out.push(Violation::new(path, format!("{} items exceeds maxItems {}", len, max)));
        }
    }

    match schema.get("items") {
        Some(Value::Array(tuple)) => {
            for (i, (item, sub)) in items.iter().zip(tuple).enumerate() {
                validate_node(item, sub, &index_path(path, i), out);
            }
        }
        Some(sub) => {
            for (i, item) in items.iter().enumerate() {
                validate_node(item, sub, &index_path(path, i), out);
            }
        }
        None => {}
    }
}
