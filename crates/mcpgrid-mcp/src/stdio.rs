//! stdio transport — line-delimited JSON-RPC on a child process's pipes.
//!
//! Writes are serialized behind a mutex; responses are matched to requests
//! by id through a pending map drained by a reader task. When the child
//! dies, every outstanding request fails with `Closed`. Closing sends
//! SIGTERM, waits out a grace period, then hard-kills.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{ConnectionError, ConnectionResult};
use crate::protocol::*;

/// How to launch an MCP server child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioSpawn {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl StdioSpawn {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: Vec::new(),
        }
    }
}

/// Default grace between SIGTERM and SIGKILL on close.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// A stdio session with a spawned MCP server.
#[derive(Debug)]
pub struct StdioConnection {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    timeout: Duration,
    grace: Duration,
}

impl StdioConnection {
    /// Spawn the child and wire up the reader task. A spawn failure is a
    /// `Connect` error — nothing was transmitted yet.
    pub fn spawn(spec: &StdioSpawn, timeout: Duration) -> ConnectionResult<Self> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ConnectionError::Connect(format!("failed to spawn '{}': {e}", spec.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectionError::Connect("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectionError::Connect("child stdout unavailable".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                            Ok(response) => {
                                if let Some(id) = response.id {
                                    let mut map = reader_pending.lock().await;
                                    if let Some(tx) = map.remove(&id) {
                                        let _ = tx.send(response);
                                    }
                                }
                                // Notifications are ignored.
                            }
                            Err(e) => {
                                debug!(line = trimmed, error = %e, "non JSON-RPC line from child");
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // Child stdout is gone; fail everything still waiting.
            reader_closed.store(true, Ordering::SeqCst);
            reader_pending.lock().await.clear();
        });

        Ok(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            timeout,
            grace: DEFAULT_GRACE,
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    async fn rpc(&self, method: &str, params: Option<Value>) -> ConnectionResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_line(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ConnectionError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(ConnectionError::Timeout(self.timeout));
            }
        };

        if let Some(error) = response.error {
            return Err(if error.code == METHOD_NOT_FOUND {
                ConnectionError::NotFound(format!("{method}: {}", error.message))
            } else {
                ConnectionError::Protocol(format!(
                    "{method} failed ({}): {}",
                    error.code, error.message
                ))
            });
        }
        response
            .result
            .ok_or_else(|| ConnectionError::Protocol(format!("empty result for {method}")))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> ConnectionResult<()> {
        let request = JsonRpcRequest::notification(method, params);
        self.write_line(&request).await
    }

    async fn write_line(&self, request: &JsonRpcRequest) -> ConnectionResult<()> {
        let line = serde_json::to_string(request)
            .map_err(|e| ConnectionError::Protocol(format!("serialize failed: {e}")))?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| ConnectionError::Closed)?;
        stdin.write_all(b"\n").await.map_err(|_| ConnectionError::Closed)?;
        stdin.flush().await.map_err(|_| ConnectionError::Closed)?;
        Ok(())
    }

    pub async fn initialize(&self) -> ConnectionResult<InitializeResult> {
        let result = self.rpc("initialize", Some(initialize_params())).await?;
        let parsed: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ConnectionError::Protocol(format!("invalid initialize result: {e}")))?;
        self.notify("notifications/initialized", None).await?;
        Ok(parsed)
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

    /// Whether the child has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Terminate the child: SIGTERM, wait up to the grace period, then kill.
    /// All outstanding requests fail with `Closed`.
    pub async fn close(self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().await.clear();

        let mut child = self.child.into_inner();
        if let Some(pid) = child.id() {
            // Ask nicely first.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(_) => {
                    debug!(pid, "stdio child exited after SIGTERM");
                    return;
                }
                Err(_) => {
                    warn!(pid, grace = ?self.grace, "stdio child ignored SIGTERM, killing");
                }
            }
        }
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}
