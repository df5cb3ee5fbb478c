//! Request authentication.
//!
//! Three modes, chosen by what is configured: bearer tokens in the
//! `Authorization` header, API keys in `X-API-Key`, or open (nothing
//! configured). Health routes stay reachable without credentials so
//! orchestrators can probe the gateway itself.

use axum::http::HeaderMap;

/// Credential configuration for the gateway surface.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub bearer_tokens: Vec<String>,
    pub api_keys: Vec<String>,
}

impl AuthConfig {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn with_bearer_tokens(tokens: Vec<String>) -> Self {
        Self {
            bearer_tokens: tokens,
            api_keys: Vec::new(),
        }
    }

    pub fn with_api_keys(keys: Vec<String>) -> Self {
        Self {
            bearer_tokens: Vec::new(),
            api_keys: keys,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.bearer_tokens.is_empty() || !self.api_keys.is_empty()
    }

    /// Whether the request's headers carry a valid credential.
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        if !self.is_enabled() {
            return true;
        }

        if let Some(token) = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            if self.bearer_tokens.iter().any(|t| t == token) {
                return true;
            }
        }

        if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            if self.api_keys.iter().any(|k| k == key) {
                return true;
            }
        }

        false
    }
}

/// Routes reachable without credentials.
pub fn is_health_route(path: &str) -> bool {
    path == "/gateway/health" || (path.starts_with("/mcp/") && path.ends_with("/health"))
}
