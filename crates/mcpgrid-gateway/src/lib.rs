//! mcpgrid-gateway — one authenticated HTTP surface over many MCP servers.
//!
//! The registry maps templates to their registered instances and balancing
//! policy, persisted as a single JSON document with atomic replacement. The
//! health checker probes instances concurrently with jitter and drives
//! eviction and readmission. The router authenticates requests, picks an
//! instance through the load balancer, and bridges HTTP clients to HTTP or
//! stdio servers, with bounded retries.

pub mod auth;
pub mod balancer;
pub mod error;
pub mod health;
pub mod pool;
pub mod registry;
pub mod router;

pub use auth::AuthConfig;
pub use balancer::LoadBalancer;
pub use error::{GatewayError, GatewayResult};
pub use health::{HealthChecker, HealthCheckerConfig, HealthEvent};
pub use pool::StdioPool;
pub use registry::{
    GatewayRegistry, Instance, InstanceStatus, Policy, RegistryStats, Strategy, TemplateRouting,
};
pub use router::{build_router, GatewayState};
