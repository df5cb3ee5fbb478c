//! Input layers and nested-path plumbing.
//!
//! Keys in config files, `--config` pairs, and overrides may address nested
//! properties with either dotted (`a.b.c`) or double-underscore (`a__b__c`)
//! paths. Both separators descend one level per segment; whichever layer is
//! applied later wins regardless of separator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{ConfigError, ConfigResult};

/// The ordered inputs to one processing run, lowest precedence first after
/// schema defaults: file, `--config` pairs, dotted overrides, environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    /// Path to a JSON or YAML config file.
    pub file: Option<PathBuf>,
    /// `--config key=value` pairs, in the order given.
    pub cli: Vec<(String, String)>,
    /// `--override a__b__c=value` pairs, in the order given.
    pub overrides: Vec<(String, String)>,
    /// Explicit environment variables visible to the processor.
    pub env: HashMap<String, String>,
}

impl ConfigLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_cli(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.cli.push((key.into(), value.into()));
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Split a key into path segments on `__` first, then `.`.
pub fn split_path(key: &str) -> Vec<String> {
    let segments: Vec<&str> = if key.contains("__") {
        key.split("__").collect()
    } else {
        key.split('.').collect()
    };
    segments.into_iter().map(str::to_string).collect()
}

/// Set a value at a nested path, creating intermediate objects as needed.
/// An intermediate segment that lands on a non-object value replaces it.
pub fn set_path(target: &mut Map<String, Value>, path: &[String], value: Value) {
    debug_assert!(!path.is_empty());
    if path.len() == 1 {
        target.insert(path[0].clone(), value);
        return;
    }

    let child = target
        .entry(path[0].clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    set_path(child.as_object_mut().expect("object just ensured"), &path[1..], value);
}

/// Read a value at a nested path.
pub fn get_path<'a>(source: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    match path {
        [] => None,
        [leaf] => source.get(leaf.as_str()),
        [head, rest @ ..] => source
            .get(head.as_str())
            .and_then(Value::as_object)
            .and_then(|obj| get_path(obj, rest)),
    }
}

/// Parse a config file (JSON by extension, YAML otherwise) into a flat map of
/// key → value where keys may still be dotted/underscored paths.
pub fn load_config_file(path: &Path) -> ConfigResult<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::FileError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let value: Value = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&raw).map_err(|e| ConfigError::FileError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::FileError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    };

    match value {
        Value::Object(map) => Ok(map),
        other => Err(ConfigError::FileError {
            path: path.to_path_buf(),
            message: format!("expected a top-level object, got {}", type_name(&other)),
        }),
    }
}

/// Parse an override terminal: JSON if it parses, else the raw string.
pub fn parse_override_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_dotted_and_underscored_paths() {
        assert_eq!(split_path("a.b.c"), vec!["a", "b", "c"]);
        assert_eq!(split_path("a__b__c"), vec!["a", "b", "c"]);
        assert_eq!(split_path("plain"), vec!["plain"]);
        // Underscore form wins when both are present in one key.
        assert_eq!(split_path("a.x__b"), vec!["a.x", "b"]);
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut map = Map::new();
        set_path(
            &mut map,
            &split_path("a__b__c"),
            json!(42),
        );
        assert_eq!(Value::Object(map)["a"]["b"]["c"], json!(42));
    }

    #[test]
    fn set_path_eight_levels_deep() {
        let mut map = Map::new();
        let path = split_path("l1__l2__l3__l4__l5__l6__l7__l8");
        set_path(&mut map, &path, json!("deep"));
        assert_eq!(get_path(&map, &path), Some(&json!("deep")));
    }

    #[test]
    fn set_path_replaces_scalar_intermediate() {
        let mut map = Map::new();
        map.insert("a".to_string(), json!("scalar"));
        set_path(&mut map, &split_path("a.b"), json!(1));
        assert_eq!(Value::Object(map)["a"]["b"], json!(1));
    }

    #[test]
    fn override_terminal_parses_json_or_keeps_string() {
        assert_eq!(parse_override_value("42"), json!(42));
        assert_eq!(parse_override_value("true"), json!(true));
        assert_eq!(parse_override_value("[1,2]"), json!([1, 2]));
        assert_eq!(parse_override_value("hello"), json!("hello"));
        assert_eq!(parse_override_value("{not json"), json!("{not json"));
    }

    #[test]
    fn loads_json_and_yaml_files() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("config.json");
        std::fs::write(&json_path, r#"{"greeting": "hi"}"#).unwrap();
        let map = load_config_file(&json_path).unwrap();
        assert_eq!(map["greeting"], json!("hi"));

        let yaml_path = dir.path().join("config.yaml");
        std::fs::write(&yaml_path, "greeting: hola\nnested:\n  level: 3\n").unwrap();
        let map = load_config_file(&yaml_path).unwrap();
        assert_eq!(map["greeting"], json!("hola"));
        assert_eq!(map["nested"]["level"], json!(3));
    }

    #[test]
    fn non_object_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::FileError { .. }));
    }
}
