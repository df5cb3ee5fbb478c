//! Connection errors.
//!
//! `Connect` is separated from the rest because the router's retry policy
//! hinges on it: non-idempotent calls may only be retried when the failure
//! happened before any request bytes were transmitted.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Could not establish the connection (nothing was transmitted).
    #[error("connection failed: {0}")]
    Connect(String),

    /// Malformed or unexpected protocol traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Unknown method, tool, or resource on the remote side.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server returned a structured failure (`isError: true`). Never
    /// retried — it is a negative result, not a transport fault.
    #[error("tool execution failed: {message}")]
    ToolExecution {
        message: String,
        result: crate::protocol::CallToolResult,
    },

    /// The connection (or its child process) is gone.
    #[error("connection closed")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;
