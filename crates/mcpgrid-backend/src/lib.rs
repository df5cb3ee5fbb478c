//! mcpgrid-backend — uniform deployment operations over container runtimes.
//!
//! A `Backend` is a tagged variant over the supported runtimes: the docker
//! CLI (primary), kubectl for cluster targets, and a pure in-memory mock
//! that preserves the observable semantics for tests. All four lifecycle
//! operations plus log and exec streaming go through the same surface, so
//! upper layers never see which runtime is underneath.

pub mod docker;
pub mod error;
pub mod kubernetes;
pub mod mock;
pub mod network;
pub mod types;

use std::time::Duration;

pub use error::{BackendError, BackendResult};
pub use types::{
    BackendKind, CleanupReport, DeployRequest, Deployment, DeploymentStatus, ExecOutput,
    LogOptions, LogStream, PortMapping, LABEL_CONFIG_HASH, LABEL_CREATED_AT, LABEL_DEPLOYMENT_ID,
    LABEL_MANAGED_BY, LABEL_TEMPLATE, MANAGED_BY_VALUE,
};

use docker::DockerBackend;
use kubernetes::KubernetesBackend;
use mock::MockBackend;

/// A concrete deployment backend, selected by name at construction time.
pub enum Backend {
    Docker(DockerBackend),
    Kubernetes(KubernetesBackend),
    Mock(MockBackend),
}

impl Backend {
    /// Construct a backend by name: `docker`, `kubernetes`, or `mock`.
    pub fn by_name(name: &str) -> BackendResult<Self> {
        match name {
            "docker" => Ok(Self::Docker(DockerBackend::new())),
            "kubernetes" => Ok(Self::Kubernetes(KubernetesBackend::new())),
            "mock" => Ok(Self::Mock(MockBackend::new())),
            other => Err(BackendError::UnknownBackend(other.to_string())),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Docker(_) => BackendKind::Docker,
            Self::Kubernetes(_) => BackendKind::Kubernetes,
            Self::Mock(_) => BackendKind::Mock,
        }
    }

    /// Materialize a deployment from a fully rendered request.
    pub async fn deploy(&self, request: DeployRequest) -> BackendResult<Deployment> {
        match self {
            Self::Docker(b) => b.deploy(request).await,
            Self::Kubernetes(b) => b.deploy(request).await,
            Self::Mock(b) => b.deploy(request).await,
        }
    }

    /// Stop a deployment, giving it `timeout` to exit before a hard kill.
    /// Stopping an already-stopped deployment is a no-op.
    pub async fn stop(&self, deployment_id: &str, timeout: Duration) -> BackendResult<()> {
        match self {
            Self::Docker(b) => b.stop(deployment_id, timeout).await,
            Self::Kubernetes(b) => b.stop(deployment_id, timeout).await,
            Self::Mock(b) => b.stop(deployment_id, timeout).await,
        }
    }

    /// Remove a stopped deployment entirely.
    pub async fn remove(&self, deployment_id: &str) -> BackendResult<()> {
        match self {
            Self::Docker(b) => b.remove(deployment_id).await,
            Self::Kubernetes(b) => b.remove(deployment_id).await,
            Self::Mock(b) => b.remove(deployment_id).await,
        }
    }

    /// List deployments carrying the platform label set, optionally filtered
    /// by template id. The backend holds no state of its own: this queries
    /// the runtime, so it survives process restarts.
    pub async fn list(&self, template: Option<&str>) -> BackendResult<Vec<Deployment>> {
        match self {
            Self::Docker(b) => b.list(template).await,
            Self::Kubernetes(b) => b.list(template).await,
            Self::Mock(b) => b.list(template).await,
        }
    }

    /// Stream log lines from a deployment.
    pub async fn logs(&self, deployment_id: &str, options: LogOptions) -> BackendResult<LogStream> {
        match self {
            Self::Docker(b) => b.logs(deployment_id, options).await,
            Self::Kubernetes(b) => b.logs(deployment_id, options).await,
            Self::Mock(b) => b.logs(deployment_id, options).await,
        }
    }

    /// Run a command inside a deployment, feeding it `stdin` and collecting
    /// output as a byte stream.
    pub async fn exec(
        &self,
        deployment_id: &str,
        argv: &[String],
        stdin: Option<Vec<u8>>,
    ) -> BackendResult<ExecOutput> {
        match self {
            Self::Docker(b) => b.exec(deployment_id, argv, stdin).await,
            Self::Kubernetes(b) => b.exec(deployment_id, argv, stdin).await,
            Self::Mock(b) => b.exec(deployment_id, argv, stdin).await,
        }
    }

    /// Remove stopped platform containers, optionally for one template.
    pub async fn cleanup_stopped(&self, template: Option<&str>) -> BackendResult<CleanupReport> {
        match self {
            Self::Docker(b) => b.cleanup_stopped(template).await,
            Self::Kubernetes(b) => b.cleanup_stopped(template).await,
            Self::Mock(b) => b.cleanup_stopped(template).await,
        }
    }
}
