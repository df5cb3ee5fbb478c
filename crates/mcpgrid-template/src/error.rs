//! Template errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or resolving templates.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(String),

    #[error("invalid template at {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type TemplateResult<T> = Result<T, TemplateError>;
