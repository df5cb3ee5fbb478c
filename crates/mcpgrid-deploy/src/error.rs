//! Deployment manager errors — a thin roll-up of the layers beneath.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Template(#[from] mcpgrid_template::TemplateError),

    #[error(transparent)]
    Config(#[from] mcpgrid_config::ConfigError),

    #[error(transparent)]
    Backend(#[from] mcpgrid_backend::BackendError),
}

pub type DeployResult<T> = Result<T, DeployError>;
