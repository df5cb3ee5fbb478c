//! Shared backend types: deployments, requests, labels, streams.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use mcpgrid_config::VolumeMount;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Label keys every platform-created container carries. `list()` filters on
/// the managed-by label, so the backend can rebuild its view of the world
/// from the runtime alone.
pub const LABEL_TEMPLATE: &str = "mcp.template";
pub const LABEL_DEPLOYMENT_ID: &str = "mcp.deployment_id";
pub const LABEL_CREATED_AT: &str = "mcp.created_at";
pub const LABEL_MANAGED_BY: &str = "mcp.managed_by";
pub const LABEL_CONFIG_HASH: &str = "mcp.config_hash";
pub const MANAGED_BY_VALUE: &str = "mcp-platform";

/// Which runtime realized a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Docker,
    Kubernetes,
    Mock,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Docker => write!(f, "docker"),
            BackendKind::Kubernetes => write!(f, "kubernetes"),
            BackendKind::Mock => write!(f, "mock"),
        }
    }
}

/// Lifecycle state of a deployment as the backend reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Unhealthy,
    Stopped,
    Failed,
}

/// One host-to-container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// A realized instance of a template on some backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Backend-assigned, opaque, never reused.
    pub deployment_id: String,
    pub template_id: String,
    /// Human-readable runtime object name (container or pod).
    pub name: String,
    pub status: DeploymentStatus,
    pub backend: BackendKind,
    pub network: Option<String>,
    pub ports: Vec<PortMapping>,
    pub created_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    /// Hash of the resolved config snapshot; present on freshly created
    /// deployments and recovered from labels on `list()`.
    pub config_hash: Option<String>,
}

impl Deployment {
    /// HTTP endpoint for the first published port, if any.
    pub fn http_endpoint(&self) -> Option<String> {
        self.ports
            .first()
            .map(|p| format!("http://127.0.0.1:{}", p.host))
    }
}

/// Everything a backend needs to create one container.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub template_id: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<VolumeMount>,
    pub args: Vec<String>,
    /// Existing network to attach to; `None` lets the backend ensure the
    /// shared platform network.
    pub network: Option<String>,
    /// Container port to publish. The host side uses the same number.
    pub port: Option<u16>,
    /// Explicit id for idempotent redeploys; `None` means the backend
    /// assigns a fresh one.
    pub deployment_id: Option<String>,
    pub config_hash: Option<String>,
    pub pull_image: bool,
    /// Extra labels beyond the platform set.
    pub labels: HashMap<String, String>,
}

/// Log retrieval mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Only the last N lines.
    pub tail: Option<usize>,
    /// Keep the stream open and follow new output.
    pub follow: bool,
}

/// A stream of log lines. The sender side closes when the source is
/// exhausted (or the follow target goes away).
pub type LogStream = mpsc::Receiver<String>;

/// Output of an exec invocation: a byte stream plus the exit code once the
/// command finishes.
pub struct ExecOutput {
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub exit: tokio::sync::oneshot::Receiver<i32>,
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_endpoint_uses_first_host_port() {
        let d = Deployment {
            deployment_id: "d-1".into(),
            template_id: "demo".into(),
            name: "demo-abc123".into(),
            status: DeploymentStatus::Running,
            backend: BackendKind::Mock,
            network: None,
            ports: vec![PortMapping { host: 18080, container: 8080 }],
            created_at: Utc::now(),
            labels: HashMap::new(),
            config_hash: None,
        };
        assert_eq!(
            d.http_endpoint().as_deref(),
            Some("http://127.0.0.1:18080")
        );
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&DeploymentStatus::Running).unwrap(),
            r#""running""#
        );
        assert_eq!(
            serde_json::to_string(&BackendKind::Docker).unwrap(),
            r#""docker""#
        );
    }
}
