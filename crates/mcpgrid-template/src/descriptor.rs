//! Template descriptor model.
//!
//! Descriptors are JSON or YAML documents. Unknown top-level keys are
//! preserved so that a load/store round trip does not drop information,
//! but nothing in the platform interprets them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire transport an MCP server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    Stdio,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Http => write!(f, "http"),
            Transport::Stdio => write!(f, "stdio"),
        }
    }
}

/// Declared transport support for a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub default: Transport,
    pub supported: Vec<Transport>,
}

impl TransportConfig {
    pub fn supports(&self, transport: Transport) -> bool {
        self.supported.contains(&transport)
    }
}

/// Where a template came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateOrigin {
    #[default]
    BuiltIn,
    User,
}

/// A statically declared tool in a template descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// One leaf of a template's `config_schema`.
///
/// Besides standard JSON-Schema keywords, leaves may carry platform
/// annotations: `env_mapping` names the environment variable the value is
/// exported as, `volume_mount` turns a path value into a bind mount,
/// `command_arg` appends the value to the container command line, and
/// `sensitive` keeps the value out of logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(default, rename = "type")]
    pub prop_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default, rename = "enum")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    /// Nested object properties, in declaration order.
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
    #[serde(default)]
    pub env_mapping: Option<String>,
    #[serde(default)]
    pub volume_mount: bool,
    #[serde(default)]
    pub command_arg: bool,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PropertySchema {
    /// Parse a raw schema value into a property schema. Non-object values
    /// yield an empty schema (treated as an untyped leaf).
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// A template's configuration schema.
///
/// Properties keep their declaration order; `command_arg` values are
/// appended to the container command line in that order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSchema {
    #[serde(default, rename = "type")]
    pub schema_type: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default, rename = "anyOf")]
    pub any_of: Option<Vec<Value>>,
    #[serde(default, rename = "oneOf")]
    pub one_of: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigSchema {
    /// Look up a single property schema by name.
    pub fn property(&self, name: &str) -> Option<PropertySchema> {
        self.properties.get(name).map(PropertySchema::from_value)
    }

    /// Iterate properties in declaration order.
    pub fn iter_properties(&self) -> impl Iterator<Item = (&String, PropertySchema)> {
        self.properties
            .iter()
            .map(|(name, raw)| (name, PropertySchema::from_value(raw)))
    }
}

/// Immutable descriptor of an MCP server template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub image: String,
    pub transport: TransportConfig,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub config_schema: ConfigSchema,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default, skip_serializing)]
    pub origin: TemplateOrigin,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TemplateDescriptor {
    /// Validate structural invariants beyond what serde enforces.
    ///
    /// Returns a path-pointed message on the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if !valid_template_id(&self.id) {
            return Err(format!(
                "id: '{}' must be lowercase alphanumeric with hyphens",
                self.id
            ));
        }
        if self.image.is_empty() {
            return Err("image: must not be empty".to_string());
        }
        if !self.transport.supports(self.transport.default) {
            return Err(format!(
                "transport.default: '{}' is not listed in transport.supported",
                self.transport.default
            ));
        }
        for (name, prop) in self.config_schema.iter_properties() {
            if let Some(default) = &prop.default {
                if !default_matches_type(default, prop.prop_type.as_deref()) {
                    return Err(format!(
                        "config_schema.properties.{name}.default: does not match declared type {:?}",
                        prop.prop_type
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Template ids are lowercase alphanumeric plus hyphens, non-empty, and
/// neither start nor end with a hyphen.
pub fn valid_template_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('-')
        && !id.ends_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn default_matches_type(value: &Value, prop_type: Option<&str>) -> bool {
    match prop_type {
        Some("string") => value.is_string(),
        Some("boolean") => value.is_boolean(),
        Some("integer") => value.is_i64() || value.is_u64(),
        Some("number") => value.is_number(),
        Some("array") => value.is_array(),
        Some("object") => value.is_object(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_descriptor() -> TemplateDescriptor {
        serde_json::from_value(json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "image": "example/demo:latest",
            "transport": {"default": "http", "supported": ["http", "stdio"]},
        }))
        .unwrap()
    }

    #[test]
    fn parses_minimal_descriptor() {
        let t = minimal_descriptor();
        assert_eq!(t.id, "demo");
        assert_eq!(t.transport.default, Transport::Http);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn unknown_top_level_keys_are_preserved() {
        let t: TemplateDescriptor = serde_json::from_value(json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "image": "example/demo:latest",
            "transport": {"default": "stdio", "supported": ["stdio"]},
            "homepage": "https://example.com",
        }))
        .unwrap();
        assert_eq!(t.extra["homepage"], json!("https://example.com"));

        let round = serde_json::to_value(&t).unwrap();
        assert_eq!(round["homepage"], json!("https://example.com"));
    }

    #[test]
    fn rejects_bad_template_ids() {
        assert!(valid_template_id("demo"));
        assert!(valid_template_id("open-search-2"));
        assert!(!valid_template_id(""));
        assert!(!valid_template_id("Demo"));
        assert!(!valid_template_id("demo_x"));
        assert!(!valid_template_id("-demo"));
        assert!(!valid_template_id("demo-"));
    }

    #[test]
    fn rejects_default_transport_outside_supported() {
        let t: TemplateDescriptor = serde_json::from_value(json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "image": "example/demo:latest",
            "transport": {"default": "http", "supported": ["stdio"]},
        }))
        .unwrap();
        let err = t.validate().unwrap_err();
        assert!(err.contains("transport.default"));
    }

    #[test]
    fn rejects_default_violating_declared_type() {
        let t: TemplateDescriptor = serde_json::from_value(json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "image": "example/demo:latest",
            "transport": {"default": "http", "supported": ["http"]},
            "config_schema": {
                "type": "object",
                "properties": {
                    "count": {"type": "integer", "default": "three"}
                }
            }
        }))
        .unwrap();
        let err = t.validate().unwrap_err();
        assert!(err.contains("config_schema.properties.count.default"));
    }

    #[test]
    fn property_annotations_parse() {
        let schema: ConfigSchema = serde_json::from_value(json!({
            "type": "object",
            "properties": {
                "api_key": {"type": "string", "env_mapping": "API_KEY", "sensitive": true},
                "data_dir": {"type": "string", "volume_mount": true},
                "verbosity": {"type": "string", "command_arg": true},
            },
            "required": ["api_key"]
        }))
        .unwrap();

        let key = schema.property("api_key").unwrap();
        assert_eq!(key.env_mapping.as_deref(), Some("API_KEY"));
        assert!(key.sensitive);
        assert!(schema.property("data_dir").unwrap().volume_mount);
        assert!(schema.property("verbosity").unwrap().command_arg);
        assert!(schema.property("missing").is_none());
    }

    #[test]
    fn properties_iterate_in_declaration_order() {
        let schema: ConfigSchema = serde_json::from_value(json!({
            "properties": {
                "zeta": {"type": "string"},
                "alpha": {"type": "string"},
                "mid": {"type": "string"},
            }
        }))
        .unwrap();
        let names: Vec<_> = schema.iter_properties().map(|(n, _)| n.clone()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn static_tools_parse() {
        let t: TemplateDescriptor = serde_json::from_value(json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "image": "example/demo:latest",
            "transport": {"default": "stdio", "supported": ["stdio"]},
            "tools": [
                {"name": "say_hello", "description": "Greet", "inputSchema": {"type": "object"}}
            ]
        }))
        .unwrap();
        assert_eq!(t.tools.len(), 1);
        assert_eq!(t.tools[0].name, "say_hello");
    }
}
