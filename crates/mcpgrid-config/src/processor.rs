//! The merge pipeline: defaults → file → `--config` → overrides → env.

use std::collections::BTreeMap;

use mcpgrid_template::{PropertySchema, TemplateDescriptor};
use serde_json::{Map, Value};
use tracing::debug;

use crate::coerce::{coerce_value, env_string};
use crate::error::{ConfigError, ConfigResult};
use crate::layers::{
    get_path, load_config_file, parse_override_value, set_path, split_path, ConfigLayers,
};
use crate::validate::validate;

/// Environment names owned by the platform. A template schema or user layer
/// that would emit one of these fails with `ReservedEnvVar`.
pub const RESERVED_ENV_VARS: &[&str] = &[
    "MCP_TEMPLATE_ID",
    "MCP_DEPLOYMENT_ID",
    "MCP_MANAGED_BY",
    "MCP_TRANSPORT",
    "MCP_CREATED_AT",
    "MCP_GATEWAY_URL",
];

/// One bind mount derived from a `volume_mount` property.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VolumeMount {
    pub host: String,
    pub container: String,
}

impl std::fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// The processor's output: a validated runtime configuration plus the plans
/// the backend consumes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessedConfig {
    /// Merged, coerced, validated configuration values.
    pub values: Map<String, Value>,
    /// Environment variables from `env_mapping` annotations.
    pub env: BTreeMap<String, String>,
    /// Bind mounts from `volume_mount` annotations.
    pub volumes: Vec<VolumeMount>,
    /// Container command arguments from `command_arg` annotations, in schema
    /// declaration order.
    pub args: Vec<String>,
    /// Property names flagged `sensitive`; their values must not be logged.
    pub sensitive: Vec<String>,
}

impl ProcessedConfig {
    /// A copy of the values safe to log or echo: sensitive leaves replaced.
    pub fn redacted_values(&self) -> Map<String, Value> {
        let mut copy = self.values.clone();
        for name in &self.sensitive {
            if copy.contains_key(name.as_str()) {
                copy.insert(name.clone(), Value::String("***".to_string()));
            }
        }
        copy
    }
}

/// Run the full pipeline for one template.
pub fn process(template: &TemplateDescriptor, layers: &ConfigLayers) -> ConfigResult<ProcessedConfig> {
    let schema = &template.config_schema;
    let mut merged: Map<String, Value> = Map::new();

    // 1. Schema defaults.
    for (name, prop) in schema.iter_properties() {
        if let Some(default) = &prop.default {
            merged.insert(name.clone(), default.clone());
        }
    }

    // 2. Config file.
    if let Some(path) = &layers.file {
        let file_map = load_config_file(path)?;
        for (key, value) in file_map {
            set_path(&mut merged, &split_path(&key), value);
        }
    }

    // 3. --config key=value pairs.
    for (key, value) in &layers.cli {
        set_path(
            &mut merged,
            &split_path(key),
            Value::String(value.clone()),
        );
    }

    // 4. Dotted overrides; terminals parse as JSON when they can.
    for (key, value) in &layers.overrides {
        set_path(&mut merged, &split_path(key), parse_override_value(value));
    }

    // 5. Environment. Reserved names are rejected before they can shadow
    // anything.
    for key in layers.env.keys() {
        if RESERVED_ENV_VARS.contains(&key.as_str()) {
            return Err(ConfigError::ReservedEnvVar(key.clone()));
        }
    }
    for (name, prop) in schema.iter_properties() {
        let env_name = property_env_name(name, &prop);
        if let Some(raw) = layers.env.get(&env_name) {
            merged.insert(name.clone(), Value::String(raw.clone()));
        }
    }

    // Coerce strings into declared types, depth-first.
    coerce_object(&mut merged, &schema.properties, "")?;

    validate(schema, &merged)?;

    // Emit plans.
    let mut env = BTreeMap::new();
    let mut volumes = Vec::new();
    let mut args = Vec::new();
    let mut sensitive = Vec::new();

    for (name, prop) in schema.iter_properties() {
        let value = merged.get(name.as_str());

        if prop.sensitive {
            sensitive.push(name.clone());
        }

        if let Some(mapping) = &prop.env_mapping {
            if RESERVED_ENV_VARS.contains(&mapping.as_str()) {
                return Err(ConfigError::ReservedEnvVar(mapping.clone()));
            }
            if let Some(value) = value.filter(|v| !v.is_null()) {
                env.insert(mapping.clone(), env_string(value));
            }
        }

        if prop.volume_mount {
            if let Some(value) = value.filter(|v| !v.is_null()) {
                volumes.extend(parse_volume_mounts(name, value)?);
            }
        }

        if prop.command_arg {
            if let Some(value) = value.filter(|v| !v.is_null()) {
                args.push(env_string(value));
            }
        }
    }

    debug!(
        template = %template.id,
        properties = merged.len(),
        env = env.len(),
        volumes = volumes.len(),
        args = args.len(),
        "configuration processed"
    );

    Ok(ProcessedConfig {
        values: merged,
        env,
        volumes,
        args,
        sensitive,
    })
}

/// The environment variable that sets a property: its `env_mapping` name if
/// declared, else `MCP_` + the upper-snake property name.
pub fn property_env_name(property: &str, schema: &PropertySchema) -> String {
    schema
        .env_mapping
        .clone()
        .unwrap_or_else(|| format!("MCP_{}", property.to_ascii_uppercase()))
}

fn coerce_object(
    target: &mut Map<String, Value>,
    properties: &Map<String, Value>,
    prefix: &str,
) -> ConfigResult<()> {
    for (name, raw_schema) in properties {
        let Some(value) = target.get(name.as_str()) else {
            continue;
        };
        let prop = PropertySchema::from_value(raw_schema);
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };

        if let (Some(nested_props), Some(obj)) = (&prop.properties, value.as_object()) {
            let mut nested = obj.clone();
            coerce_object(&mut nested, nested_props, &path)?;
            target.insert(name.clone(), Value::Object(nested));
            continue;
        }

        let coerced = coerce_value(&path, value.clone(), &prop)?;
        target.insert(name.clone(), coerced);
    }
    Ok(())
}

/// Split a `volume_mount` value into bind mounts. Accepts a single path, a
/// `host:container` pair, several whitespace- or comma-separated entries, or
/// an array of any of those.
fn parse_volume_mounts(property: &str, value: &Value) -> ConfigResult<Vec<VolumeMount>> {
    let entries: Vec<String> = match value {
        Value::String(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        other => {
            return Err(ConfigError::invalid(
                property,
                format!("volume_mount expects path strings, got {other}"),
            ))
        }
    };

    let mut mounts = Vec::new();
    for entry in entries {
        let mount = match entry.split_once(':') {
            Some((host, container)) if !host.is_empty() && !container.is_empty() => VolumeMount {
                host: host.to_string(),
                container: container.to_string(),
            },
            Some(_) => {
                return Err(ConfigError::invalid(
                    property,
                    format!("malformed volume mount '{entry}'"),
                ))
            }
            None => VolumeMount {
                host: entry.clone(),
                container: entry.clone(),
            },
        };
        mounts.push(mount);
    }
    Ok(mounts)
}

/// Read a nested value from processed output (test and caller convenience).
pub fn lookup<'a>(values: &'a Map<String, Value>, dotted: &str) -> Option<&'a Value> {
    get_path(values, &split_path(dotted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(schema: serde_json::Value) -> TemplateDescriptor {
        serde_json::from_value(json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "image": "example/demo:latest",
            "transport": {"default": "http", "supported": ["http", "stdio"]},
            "config_schema": schema,
        }))
        .unwrap()
    }

    fn greeting_template() -> TemplateDescriptor {
        template(json!({
            "type": "object",
            "properties": {
                "hello_from": {"type": "string", "default": "X", "env_mapping": "MCP_HELLO_FROM"},
            }
        }))
    }

    #[test]
    fn defaults_only() {
        let t = greeting_template();
        let out = process(&t, &ConfigLayers::new()).unwrap();
        assert_eq!(out.values["hello_from"], json!("X"));
        assert_eq!(out.env["MCP_HELLO_FROM"], "X");
    }

    #[test]
    fn precedence_env_beats_cli_beats_file_beats_default() {
        let t = greeting_template();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        std::fs::write(&file, r#"{"hello_from": "Y"}"#).unwrap();

        // File over default.
        let out = process(&t, &ConfigLayers::new().with_file(&file)).unwrap();
        assert_eq!(out.values["hello_from"], json!("Y"));

        // CLI over file.
        let out = process(
            &t,
            &ConfigLayers::new().with_file(&file).with_cli("hello_from", "Z"),
        )
        .unwrap();
        assert_eq!(out.values["hello_from"], json!("Z"));

        // Env over everything.
        let out = process(
            &t,
            &ConfigLayers::new()
                .with_file(&file)
                .with_cli("hello_from", "Z")
                .with_env("MCP_HELLO_FROM", "W"),
        )
        .unwrap();
        assert_eq!(out.values["hello_from"], json!("W"));
        assert_eq!(out.env["MCP_HELLO_FROM"], "W");
    }

    #[test]
    fn overrides_beat_cli_and_parse_json_terminals() {
        let t = template(json!({
            "properties": {
                "limits": {"type": "object", "properties": {
                    "depth": {"type": "integer"}
                }}
            }
        }));
        let out = process(
            &t,
            &ConfigLayers::new()
                .with_cli("limits__depth", "3")
                .with_override("limits__depth", "7"),
        )
        .unwrap();
        assert_eq!(out.values["limits"]["depth"], json!(7));
    }

    #[test]
    fn dotted_and_underscored_paths_address_the_same_slot() {
        let t = template(json!({
            "properties": {
                "limits": {"type": "object", "properties": {
                    "depth": {"type": "integer"}
                }}
            }
        }));
        let out = process(
            &t,
            &ConfigLayers::new()
                .with_override("limits.depth", "1")
                .with_override("limits__depth", "2"),
        )
        .unwrap();
        // Later-specified wins regardless of separator.
        assert_eq!(out.values["limits"]["depth"], json!(2));
    }

    #[test]
    fn processing_is_idempotent() {
        let t = template(json!({
            "properties": {
                "flag": {"type": "boolean", "default": false, "env_mapping": "FLAG"},
                "count": {"type": "integer", "default": 2, "command_arg": true},
            }
        }));
        let layers = ConfigLayers::new().with_cli("flag", "yes");
        let a = process(&t, &layers).unwrap();
        let b = process(&t, &layers).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn env_mapping_emitted_only_for_non_null_values() {
        let t = template(json!({
            "properties": {
                "set_one": {"type": "string", "default": "v", "env_mapping": "SET_ONE"},
                "unset_one": {"type": "string", "env_mapping": "UNSET_ONE"},
            }
        }));
        let out = process(&t, &ConfigLayers::new()).unwrap();
        assert_eq!(out.env.get("SET_ONE").map(String::as_str), Some("v"));
        assert!(!out.env.contains_key("UNSET_ONE"));
    }

    #[test]
    fn reserved_env_vars_are_rejected_in_layers_and_mappings() {
        let t = greeting_template();
        let err = process(
            &t,
            &ConfigLayers::new().with_env("MCP_TEMPLATE_ID", "spoofed"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ReservedEnvVar(name) if name == "MCP_TEMPLATE_ID"));

        let t = template(json!({
            "properties": {
                "sneaky": {"type": "string", "default": "v", "env_mapping": "MCP_DEPLOYMENT_ID"},
            }
        }));
        let err = process(&t, &ConfigLayers::new()).unwrap_err();
        assert!(matches!(err, ConfigError::ReservedEnvVar(_)));
    }

    #[test]
    fn env_layer_uses_mcp_prefixed_name_without_mapping() {
        let t = template(json!({
            "properties": {
                "read_only": {"type": "boolean", "default": false},
            }
        }));
        let out = process(
            &t,
            &ConfigLayers::new().with_env("MCP_READ_ONLY", "yes"),
        )
        .unwrap();
        assert_eq!(out.values["read_only"], json!(true));
    }

    #[test]
    fn volume_mounts_split_pairs_and_multiple_paths() {
        let t = template(json!({
            "properties": {
                "data": {"type": "string", "volume_mount": true},
            }
        }));
        let out = process(
            &t,
            &ConfigLayers::new().with_cli("data", "/host/a:/srv/a, /shared"),
        )
        .unwrap();
        assert_eq!(
            out.volumes,
            vec![
                VolumeMount { host: "/host/a".into(), container: "/srv/a".into() },
                VolumeMount { host: "/shared".into(), container: "/shared".into() },
            ]
        );
    }

    #[test]
    fn command_args_follow_schema_declaration_order() {
        let t = template(json!({
            "properties": {
                "zone": {"type": "string", "default": "west", "command_arg": true},
                "attempts": {"type": "integer", "default": 2, "command_arg": true},
            }
        }));
        let out = process(&t, &ConfigLayers::new()).unwrap();
        assert_eq!(out.args, vec!["west", "2"]);
    }

    #[test]
    fn sensitive_values_are_redacted() {
        let t = template(json!({
            "properties": {
                "api_key": {"type": "string", "sensitive": true},
                "plain": {"type": "string", "default": "ok"},
            }
        }));
        let out = process(&t, &ConfigLayers::new().with_cli("api_key", "s3cret")).unwrap();
        let redacted = out.redacted_values();
        assert_eq!(redacted["api_key"], json!("***"));
        assert_eq!(redacted["plain"], json!("ok"));
        // The real value is still present for the backend.
        assert_eq!(out.values["api_key"], json!("s3cret"));
    }

    #[test]
    fn coercion_failure_points_at_the_property() {
        let t = template(json!({
            "properties": {"port": {"type": "integer"}}
        }));
        let err = process(&t, &ConfigLayers::new().with_cli("port", "eighty")).unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn empty_layers_return_defaults_unchanged() {
        let t = template(json!({
            "properties": {
                "a": {"type": "string", "default": "1"},
                "b": {"type": "integer", "default": 2},
            }
        }));
        let out = process(&t, &ConfigLayers::new()).unwrap();
        assert_eq!(out.values["a"], json!("1"));
        assert_eq!(out.values["b"], json!(2));
        assert!(out.volumes.is_empty());
        assert!(out.args.is_empty());
    }

    #[test]
    fn lookup_reads_nested_paths() {
        let t = template(json!({
            "properties": {
                "outer": {"type": "object", "properties": {
                    "inner": {"type": "string"}
                }}
            }
        }));
        let out = process(
            &t,
            &ConfigLayers::new().with_override("outer__inner", "deep"),
        )
        .unwrap();
        assert_eq!(lookup(&out.values, "outer.inner"), Some(&json!("deep")));
    }
}
