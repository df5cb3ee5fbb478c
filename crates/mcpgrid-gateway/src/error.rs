//! Gateway errors and their HTTP translation.
//!
//! Error bodies follow the wire contract: `{"error": {"type", "message",
//! "details"}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("template '{0}' is not registered")]
    TemplateNotFound(String),

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no healthy instances for template '{0}'")]
    NoHealthyInstances(String),

    #[error("request queue full for instance '{0}'")]
    QueueFull(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("upstream MCP error: {message}")]
    Upstream {
        message: String,
        details: Option<Value>,
    },

    #[error("request timed out against instance '{instance_id}'")]
    Timeout { instance_id: String },

    #[error("registry persistence failed: {0}")]
    Persistence(String),

    #[error("{0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TemplateNotFound(_) | Self::InstanceNotFound(_) | Self::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::NoHealthyInstances(_) | Self::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::AuthFailed => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Persistence(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::TemplateNotFound(_) => "template_not_found",
            Self::InstanceNotFound(_) => "instance_not_found",
            Self::NotFound(_) => "not_found",
            Self::NoHealthyInstances(_) => "no_healthy_instances",
            Self::QueueFull(_) => "queue_full",
            Self::AuthFailed => "auth_failed",
            Self::BadRequest(_) => "bad_request",
            Self::Upstream { .. } => "upstream_error",
            Self::Timeout { .. } => "timeout",
            Self::Persistence(_) => "persistence_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn body(&self) -> Value {
        let details = match self {
            Self::Upstream { details, .. } => details.clone().unwrap_or(Value::Null),
            Self::Timeout { instance_id } => json!({"instance_id": instance_id}),
            _ => Value::Null,
        };
        json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "details": details,
            }
        })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
