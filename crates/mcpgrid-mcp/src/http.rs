//! HTTP transport — one JSON-RPC request/response per call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::{ConnectionError, ConnectionResult};
use crate::protocol::*;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A pooled HTTP session with one MCP endpoint.
///
/// The underlying `reqwest::Client` keeps connections alive per endpoint;
/// cloning the connection shares the pool.
#[derive(Clone)]
pub struct HttpConnection {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    next_id: std::sync::Arc<AtomicU64>,
}

impl HttpConnection {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> ConnectionResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        Ok(Self::with_client(client, endpoint, timeout))
    }

    /// Share an existing client (and therefore its connection pool).
    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn rpc(&self, method: &str, params: Option<Value>) -> ConnectionResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        debug!(endpoint = %self.endpoint, method, id, "http rpc");

        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::Protocol(format!(
                "endpoint returned HTTP {status}"
            )));
        }

        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ConnectionError::Protocol(format!("invalid JSON-RPC response: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(rpc_error(method, error));
        }
        parsed
            .result
            .ok_or_else(|| ConnectionError::Protocol(format!("empty result for {method}")))
    }

    pub async fn initialize(&self) -> ConnectionResult<InitializeResult> {
        let result = self.rpc("initialize", Some(initialize_params())).await?;
        serde_json::from_value(result)
            .map_err(|e| ConnectionError::Protocol(format!("invalid initialize result: {e}")))
    }

    pub async fn list_tools(&self) -> ConnectionResult<Vec<Tool>> {
        let result = self.rpc("tools/list", None).await?;
        let parsed: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| ConnectionError::Protocol(format!("invalid tools/list result: {e}")))?;
        Ok(parsed.tools)
    }

    pub async fn list_resources(&self) -> ConnectionResult<ListResourcesResult> {
        let result = self.rpc("resources/list", None).await?;
        serde_json::from_value(result)
            .map_err(|e| ConnectionError::Protocol(format!("invalid resources/list result: {e}")))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> ConnectionResult<CallToolResult> {
        let params = serde_json::json!({"name": name, "arguments": arguments});
        let result = self.rpc("tools/call", Some(params)).await?;
        let parsed: CallToolResult = serde_json::from_value(result)
            .map_err(|e| ConnectionError::Protocol(format!("invalid tools/call result: {e}")))?;
        if parsed.is_error {
            return Err(ConnectionError::ToolExecution {
                message: parsed.text(),
                result: parsed,
            });
        }
        Ok(parsed)
    }

    pub async fn read_resource(&self, uri: &str) -> ConnectionResult<ReadResourceResult> {
        let params = serde_json::json!({"uri": uri});
        let result = self.rpc("resources/read", Some(params)).await?;
        serde_json::from_value(result)
            .map_err(|e| ConnectionError::Protocol(format!("invalid resources/read result: {e}")))
    }
}

fn classify_reqwest_error(e: reqwest::Error, timeout: Duration) -> ConnectionError {
    if e.is_timeout() {
        ConnectionError::Timeout(timeout)
    } else if e.is_connect() {
        ConnectionError::Connect(e.to_string())
    } else {
        ConnectionError::Protocol(e.to_string())
    }
}

fn rpc_error(method: &str, error: JsonRpcError) -> ConnectionError {
    if error.code == METHOD_NOT_FOUND {
        ConnectionError::NotFound(format!("{method}: {}", error.message))
    } else {
        ConnectionError::Protocol(format!("{method} failed ({}): {}", error.code, error.message))
    }
}
