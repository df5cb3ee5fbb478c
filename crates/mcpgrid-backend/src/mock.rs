//! Mock backend — pure in-memory, for tests and dry development.
//!
//! Preserves every observable behavior of a real backend except I/O:
//! deployments get unique ids, labels, and lifecycle states; `list()`
//! filters by template; `stop` is idempotent; `logs`/`exec` produce
//! streams from stored data.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{BackendError, BackendResult};
use crate::types::*;

struct MockEntry {
    deployment: Deployment,
    logs: Vec<String>,
}

#[derive(Default)]
pub struct MockBackend {
    entries: Mutex<HashMap<String, MockEntry>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deploy(&self, request: DeployRequest) -> BackendResult<Deployment> {
        let deployment_id = request
            .deployment_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let created_at = Utc::now();

        let mut labels: HashMap<String, String> = request.labels.clone();
        labels.insert(LABEL_TEMPLATE.into(), request.template_id.clone());
        labels.insert(LABEL_DEPLOYMENT_ID.into(), deployment_id.clone());
        labels.insert(LABEL_CREATED_AT.into(), created_at.to_rfc3339());
        labels.insert(LABEL_MANAGED_BY.into(), MANAGED_BY_VALUE.into());

        let deployment = Deployment {
            deployment_id: deployment_id.clone(),
            template_id: request.template_id.clone(),
            name: format!("{}-mock", request.template_id),
            status: DeploymentStatus::Running,
            backend: BackendKind::Mock,
            network: request.network.clone().or_else(|| Some("mcp-platform".into())),
            ports: request
                .port
                .map(|p| vec![PortMapping { host: p, container: p }])
                .unwrap_or_default(),
            created_at,
            labels,
            config_hash: request.config_hash.clone(),
        };

        let mut entries = self.entries.lock().expect("mock entries lock");
        entries.insert(
            deployment_id.clone(),
            MockEntry {
                deployment: deployment.clone(),
                logs: vec![format!("started {}", request.image)],
            },
        );
        debug!(%deployment_id, template = %request.template_id, "mock deployment created");
        Ok(deployment)
    }

    pub async fn stop(&self, deployment_id: &str, _timeout: Duration) -> BackendResult<()> {
        let mut entries = self.entries.lock().expect("mock entries lock");
        let entry = entries
            .get_mut(deployment_id)
            .ok_or_else(|| BackendError::NotFound(deployment_id.to_string()))?;
        entry.deployment.status = DeploymentStatus::Stopped;
        entry.logs.push("stopped".to_string());
        Ok(())
    }

    pub async fn remove(&self, deployment_id: &str) -> BackendResult<()> {
        let mut entries = self.entries.lock().expect("mock entries lock");
        entries
            .remove(deployment_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(deployment_id.to_string()))
    }

    pub async fn list(&self, template: Option<&str>) -> BackendResult<Vec<Deployment>> {
        let entries = self.entries.lock().expect("mock entries lock");
        let mut all: Vec<Deployment> = entries
            .values()
            .map(|e| e.deployment.clone())
            .filter(|d| template.is_none_or(|t| d.template_id == t))
            .collect();
        all.sort_by(|a, b| a.deployment_id.cmp(&b.deployment_id));
        Ok(all)
    }

    pub async fn logs(&self, deployment_id: &str, options: LogOptions) -> BackendResult<LogStream> {
        let lines = {
            let entries = self.entries.lock().expect("mock entries lock");
            let entry = entries
                .get(deployment_id)
                .ok_or_else(|| BackendError::NotFound(deployment_id.to_string()))?;
            let logs = &entry.logs;
            match options.tail {
                Some(n) if n < logs.len() => logs[logs.len() - n..].to_vec(),
                _ => logs.clone(),
            }
        };

        let (tx, rx) = mpsc::channel(lines.len().max(1));
        tokio::spawn(async move {
            for line in lines {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    pub async fn exec(
        &self,
        deployment_id: &str,
        argv: &[String],
        stdin: Option<Vec<u8>>,
    ) -> BackendResult<ExecOutput> {
        {
            let entries = self.entries.lock().expect("mock entries lock");
            if !entries.contains_key(deployment_id) {
                return Err(BackendError::NotFound(deployment_id.to_string()));
            }
        }

        // Echo the command line and any stdin back, like a well-behaved shell.
        let mut output = argv.join(" ").into_bytes();
        if let Some(input) = stdin {
            output.push(b'\n');
            output.extend(input);
        }

        let (tx, rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(output).await;
            let _ = exit_tx.send(0);
        });
        Ok(ExecOutput {
            stdout: rx,
            exit: exit_rx,
        })
    }

    pub async fn cleanup_stopped(&self, template: Option<&str>) -> BackendResult<CleanupReport> {
        let mut entries = self.entries.lock().expect("mock entries lock");
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.deployment.status == DeploymentStatus::Stopped)
            .filter(|(_, e)| template.is_none_or(|t| e.deployment.template_id == t))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            entries.remove(id);
        }
        Ok(CleanupReport { removed: doomed })
    }

    /// Append a log line to a deployment (test helper).
    pub fn push_log(&self, deployment_id: &str, line: impl Into<String>) {
        let mut entries = self.entries.lock().expect("mock entries lock");
        if let Some(entry) = entries.get_mut(deployment_id) {
            entry.logs.push(line.into());
        }
    }

    /// Force a deployment's status (test helper).
    pub fn set_status(&self, deployment_id: &str, status: DeploymentStatus) {
        let mut entries = self.entries.lock().expect("mock entries lock");
        if let Some(entry) = entries.get_mut(deployment_id) {
            entry.deployment.status = status;
        }
    }
}
