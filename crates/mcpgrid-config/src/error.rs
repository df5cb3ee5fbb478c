//! Configuration processing errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while merging, coercing, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration at '{path}': {message}")]
    InvalidConfiguration { path: String, message: String },

    #[error("environment variable '{0}' is reserved by the platform")]
    ReservedEnvVar(String),

    #[error("failed to read config file {path}: {message}")]
    FileError { path: PathBuf, message: String },
}

impl ConfigError {
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
