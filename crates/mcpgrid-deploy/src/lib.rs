//! mcpgrid-deploy — the deployment manager.
//!
//! Ties the template registry, configuration processor, and backend
//! together: resolve the template, process the config layers, render a
//! deploy request, and hand it to the backend. Owns deployment identity
//! (idempotent redeploys by config hash) and status aggregation with the
//! gateway's health view.

pub mod error;
pub mod manager;

pub use error::{DeployError, DeployResult};
pub use manager::{
    DeployOptions, DeployOutcome, DeploymentManager, DeploymentPlan, GatewayHealth,
};
