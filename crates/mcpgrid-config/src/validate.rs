//! Post-merge validation: required properties, enums, numeric ranges, and
//! `anyOf`/`oneOf` alternative groups.

use mcpgrid_template::ConfigSchema;
use serde_json::{Map, Value};

use crate::coerce::{describe, matches_type};
use crate::error::{ConfigError, ConfigResult};

/// Validate a merged-and-coerced config object against the template schema.
pub fn validate(schema: &ConfigSchema, config: &Map<String, Value>) -> ConfigResult<()> {
    for required in &schema.required {
        if config.get(required).is_none_or(Value::is_null) {
            return Err(ConfigError::invalid(
                required,
                "required property is missing",
            ));
        }
    }

    for (name, prop) in schema.iter_properties() {
        let Some(value) = config.get(name.as_str()) else {
            continue;
        };
        if value.is_null() {
            continue;
        }

        if let Some(ty) = prop.prop_type.as_deref() {
            if !matches_type(value, ty) {
                return Err(ConfigError::invalid(
                    name,
                    format!("expected {ty}, got {}", describe(value)),
                ));
            }
        }

        if let Some(allowed) = &prop.enum_values {
            if !allowed.contains(value) {
                return Err(ConfigError::invalid(
                    name,
                    format!(
                        "value {} is not one of {}",
                        describe(value),
                        Value::Array(allowed.clone())
                    ),
                ));
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = prop.minimum {
                if n < min {
                    return Err(ConfigError::invalid(
                        name,
                        format!("{n} is below the minimum {min}"),
                    ));
                }
            }
            if let Some(max) = prop.maximum {
                if n > max {
                    return Err(ConfigError::invalid(
                        name,
                        format!("{n} is above the maximum {max}"),
                    ));
                }
            }
        }
    }

    if let Some(alternatives) = &schema.any_of {
        let satisfied = alternatives.iter().filter(|s| satisfies(s, config)).count();
        if satisfied == 0 {
            return Err(ConfigError::invalid(
                "anyOf",
                format!(
                    "none of the {} alternative requirement groups is satisfied",
                    alternatives.len()
                ),
            ));
        }
    }

    if let Some(alternatives) = &schema.one_of {
        let satisfied = alternatives.iter().filter(|s| satisfies(s, config)).count();
        if satisfied != 1 {
            return Err(ConfigError::invalid(
                "oneOf",
                format!(
                    "exactly one alternative must be satisfied, found {satisfied} of {}",
                    alternatives.len()
                ),
            ));
        }
    }

    Ok(())
}

/// Whether a config satisfies one alternative subschema. Alternatives are
/// requirement groups: their `required` names must be present and non-null,
/// and any property constraints they restate must hold.
fn satisfies(subschema: &Value, config: &Map<String, Value>) -> bool {
    let Some(obj) = subschema.as_object() else {
        return false;
    };

    if let Some(required) = obj.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if config.get(name).is_none_or(Value::is_null) {
                return false;
            }
        }
    }

    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        for (name, constraint) in props {
            let Some(value) = config.get(name) else {
                continue;
            };
            if let Some(constant) = constraint.get("const") {
                if value != constant {
                    return false;
                }
            }
            if let Some(allowed) = constraint.get("enum").and_then(Value::as_array) {
                if !allowed.contains(value) {
                    return false;
                }
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(raw: serde_json::Value) -> ConfigSchema {
        serde_json::from_value(raw).unwrap()
    }

    fn object(raw: serde_json::Value) -> Map<String, Value> {
        raw.as_object().unwrap().clone()
    }

    #[test]
    fn missing_required_property_fails() {
        let s = schema(json!({
            "properties": {"token": {"type": "string"}},
            "required": ["token"]
        }));
        let err = validate(&s, &object(json!({}))).unwrap_err();
        assert!(err.to_string().contains("token"));

        assert!(validate(&s, &object(json!({"token": "abc"}))).is_ok());
    }

    #[test]
    fn null_does_not_satisfy_required() {
        let s = schema(json!({
            "properties": {"token": {"type": "string"}},
            "required": ["token"]
        }));
        assert!(validate(&s, &object(json!({"token": null}))).is_err());
    }

    #[test]
    fn enum_constraint_is_enforced() {
        let s = schema(json!({
            "properties": {"mode": {"type": "string", "enum": ["fast", "safe"]}}
        }));
        assert!(validate(&s, &object(json!({"mode": "fast"}))).is_ok());
        let err = validate(&s, &object(json!({"mode": "reckless"}))).unwrap_err();
        assert!(err.to_string().contains("mode"));
    }

    #[test]
    fn numeric_ranges_are_enforced() {
        let s = schema(json!({
            "properties": {"port": {"type": "integer", "minimum": 1.0, "maximum": 65535.0}}
        }));
        assert!(validate(&s, &object(json!({"port": 8080}))).is_ok());
        assert!(validate(&s, &object(json!({"port": 0}))).is_err());
        assert!(validate(&s, &object(json!({"port": 70000}))).is_err());
    }

    #[test]
    fn any_of_needs_at_least_one_group() {
        let s = schema(json!({
            "properties": {
                "password": {"type": "string"},
                "token": {"type": "string"},
            },
            "anyOf": [
                {"required": ["password"]},
                {"required": ["token"]},
            ]
        }));
        assert!(validate(&s, &object(json!({"token": "t"}))).is_ok());
        assert!(validate(&s, &object(json!({"password": "p"}))).is_ok());
        assert!(validate(&s, &object(json!({}))).is_err());
    }

    #[test]
    fn one_of_rejects_zero_and_multiple_groups() {
        let s = schema(json!({
            "properties": {
                "basic_auth": {"type": "string"},
                "oauth_token": {"type": "string"},
            },
            "oneOf": [
                {"required": ["basic_auth"]},
                {"required": ["oauth_token"]},
            ]
        }));
        assert!(validate(&s, &object(json!({"basic_auth": "u:p"}))).is_ok());
        assert!(validate(&s, &object(json!({}))).is_err());
        assert!(validate(
            &s,
            &object(json!({"basic_auth": "u:p", "oauth_token": "t"}))
        )
        .is_err());
    }

    #[test]
    fn alternative_const_constraints_participate() {
        let s = schema(json!({
            "properties": {
                "auth_mode": {"type": "string"},
                "oauth_provider": {"type": "string"},
            },
            "anyOf": [
                {"properties": {"auth_mode": {"const": "none"}}, "required": ["auth_mode"]},
                {"required": ["auth_mode", "oauth_provider"]},
            ]
        }));
        assert!(validate(&s, &object(json!({"auth_mode": "none"}))).is_ok());
        assert!(validate(
            &s,
            &object(json!({"auth_mode": "oauth", "oauth_provider": "github"}))
        )
        .is_ok());
        assert!(validate(&s, &object(json!({"auth_mode": "oauth"}))).is_err());
    }
}
