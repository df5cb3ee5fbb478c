//! Backend errors, with enough context to act on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend '{backend}' is not available: {message}")]
    Unavailable { backend: String, message: String },

    #[error("failed to pull image '{image}': {message}")]
    ImagePullFailed { image: String, message: String },

    #[error("failed to bind port {port}: {message}")]
    PortBindFailed { port: u16, message: String },

    #[error("network allocation failed: {0}")]
    NetworkAllocationFailed(String),

    #[error("deployment of template '{template}' failed: {message}")]
    DeploymentFailed { template: String, message: String },

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),
}

pub type BackendResult<T> = Result<T, BackendError>;
