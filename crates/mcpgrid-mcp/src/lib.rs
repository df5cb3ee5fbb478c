//! mcpgrid-mcp — client connections to MCP servers.
//!
//! An MCP server speaks JSON-RPC 2.0 over one of two transports: HTTP
//! (request/response per call) or stdio (line-delimited JSON on a child
//! process's pipes). `Connection` abstracts over both and exposes the five
//! protocol operations the platform needs: initialize, tools/list,
//! tools/call, resources/list, resources/read.

pub mod error;
pub mod http;
pub mod protocol;
pub mod stdio;

pub use error::{ConnectionError, ConnectionResult};
pub use http::HttpConnection;
pub use protocol::{
    CallToolResult, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ListResourcesResult, ListToolsResult, ReadResourceResult, Resource, Tool, ToolContent,
    PROTOCOL_VERSION,
};
pub use stdio::{StdioConnection, StdioSpawn};

use serde_json::Value;

/// A live session with one MCP server over either transport.
pub enum Connection {
    Http(HttpConnection),
    Stdio(StdioConnection),
}

impl Connection {
    pub async fn initialize(&self) -> ConnectionResult<InitializeResult> {
        match self {
            Self::Http(c) => c.initialize().await,
            Self::Stdio(c) => c.initialize().await,
        }
    }

    pub async fn list_tools(&self) -> ConnectionResult<Vec<Tool>> {
        match self {
            Self::Http(c) => c.list_tools().await,
            Self::Stdio(c) => c.list_tools().await,
        }
    }

    pub async fn list_resources(&self) -> ConnectionResult<ListResourcesResult> {
        match self {
            Self::Http(c) => c.list_resources().await,
            Self::Stdio(c) => c.list_resources().await,
        }
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> ConnectionResult<CallToolResult> {
        match self {
            Self::Http(c) => c.call_tool(name, arguments).await,
            Self::Stdio(c) => c.call_tool(name, arguments).await,
        }
    }

    pub async fn read_resource(&self, uri: &str) -> ConnectionResult<ReadResourceResult> {
        match self {
            Self::Http(c) => c.read_resource(uri).await,
            Self::Stdio(c) => c.read_resource(uri).await,
        }
    }

    /// Close the session. Outstanding calls fail with `Closed`; stdio
    /// children get a terminate signal, then a bounded grace period, then a
    /// hard kill.
    pub async fn close(self) {
        match self {
            Self::Http(_) => {}
            Self::Stdio(c) => c.close().await,
        }
    }
}
