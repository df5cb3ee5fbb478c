//! mcpgrid-tools — "what tools does template X expose?"
//!
//! Answers come from a four-tier cascade: a TTL cache, a live HTTP probe of
//! a running deployment, a short-lived stdio spawn, and finally the
//! template's static tool list. Concurrent lookups for one template
//! coalesce into a single in-flight discovery; entries near expiry are
//! served stale while a background refresh runs.

pub mod cache;
pub mod discovery;

pub use cache::{DiscoveryMethod, DiscoveryResult, LoadResult, ToolCache};
pub use discovery::{ephemeral_spawn, DiscoverOptions, ToolManager};
