//! mcpgrid-template — template descriptors and the on-disk registry.
//!
//! A template is the immutable description of an MCP server: container
//! image, transport, configuration schema, and optional static tool
//! metadata. Templates live in per-template directories under a well-known
//! root and are loaded once at startup; `refresh()` re-reads the tree.

pub mod descriptor;
pub mod error;
pub mod registry;

pub use descriptor::{
    ConfigSchema, PropertySchema, TemplateDescriptor, TemplateOrigin, ToolDef, Transport,
    TransportConfig,
};
pub use error::{TemplateError, TemplateResult};
pub use registry::TemplateRegistry;
