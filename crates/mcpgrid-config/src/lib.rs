//! mcpgrid-config — the configuration processor.
//!
//! Merges values for a template from up to five ordered sources (schema
//! defaults, config file, `--config` pairs, dotted overrides, environment),
//! coerces strings into the schema-declared types, validates the result, and
//! emits the runtime config plus the environment map, bind mounts, and
//! command-line arguments the backend needs.

pub mod coerce;
pub mod error;
pub mod layers;
pub mod processor;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use layers::ConfigLayers;
pub use processor::{process, ProcessedConfig, VolumeMount, RESERVED_ENV_VARS};
