//! String-to-schema type coercion.

use mcpgrid_template::PropertySchema;
use serde_json::Value;

use crate::error::{ConfigError, ConfigResult};
use crate::layers::type_name;

/// Coerce a merged value into the type its schema leaf declares.
///
/// Only strings are coerced; values that already carry a JSON type are passed
/// through (a `true` from a YAML file stays a boolean). Failure names the
/// property path and the expected type.
pub fn coerce_value(path: &str, value: Value, schema: &PropertySchema) -> ConfigResult<Value> {
    let Some(prop_type) = schema.prop_type.as_deref() else {
        return Ok(value);
    };

    let Value::String(raw) = value else {
        return Ok(value);
    };

    match prop_type {
        "boolean" => coerce_bool(&raw)
            .map(Value::Bool)
            .ok_or_else(|| expected(path, "boolean", &raw)),
        "integer" => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| expected(path, "integer", &raw)),
        "number" => raw
            .trim()
            .parse::<f64>()
            .map(Value::from)
            .map_err(|_| expected(path, "number", &raw)),
        "array" => coerce_array(path, &raw, schema),
        "object" => serde_json::from_str::<Value>(&raw)
            .ok()
            .filter(Value::is_object)
            .ok_or_else(|| expected(path, "object", &raw)),
        _ => Ok(Value::String(raw)),
    }
}

fn coerce_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Arrays accept JSON (`["a","b"]`) or a comma-separated list (`a,b`).
/// Comma-separated items are coerced against the `items` type when one is
/// declared.
fn coerce_array(path: &str, raw: &str, schema: &PropertySchema) -> ConfigResult<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str::<Value>(trimmed)
            .ok()
            .filter(Value::is_array)
            .ok_or_else(|| expected(path, "array", raw));
    }

    let item_schema = schema
        .extra
        .get("items")
        .map(PropertySchema::from_value)
        .unwrap_or_default();

    let mut items = Vec::new();
    for (i, part) in trimmed.split(',').enumerate() {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let item = coerce_value(
            &format!("{path}[{i}]"),
            Value::String(part.to_string()),
            &item_schema,
        )?;
        items.push(item);
    }
    Ok(Value::Array(items))
}

/// Render a resolved value as an environment-variable string.
pub fn env_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(env_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

fn expected(path: &str, ty: &str, raw: &str) -> ConfigError {
    ConfigError::invalid(path, format!("expected {ty}, got '{raw}'"))
}

/// Check a non-string value against the declared type (used for validation
/// after coercion).
pub fn matches_type(value: &Value, prop_type: &str) -> bool {
    match prop_type {
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

pub(crate) fn describe(value: &Value) -> String {
    format!("{} ({})", value, type_name(value))
}
