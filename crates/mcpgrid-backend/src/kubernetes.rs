//! Kubernetes backend — drives kubectl for cluster targets.
//!
//! Deployments map to single pods labelled with the platform set. Subnet
//! management is the cluster's concern, so there is no network allocation
//! here; everything else mirrors the docker backend's surface.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, AsyncBufReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{BackendError, BackendResult};
use crate::types::*;

/// Labels use dots, which kubernetes label keys forbid in the name part;
/// swap them for dashes on the way in and back on the way out.
fn k8s_label_key(key: &str) -> String {
    key.replace('.', "-")
}

pub struct KubernetesBackend {
    namespace: String,
}

impl KubernetesBackend {
    pub fn new() -> Self {
        Self {
            namespace: std::env::var("MCP_K8S_NAMESPACE").unwrap_or_else(|_| "default".into()),
        }
    }

    pub async fn deploy(&self, request: DeployRequest) -> BackendResult<Deployment> {
        let deployment_id = request
            .deployment_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let created_at = Utc::now();
        let name = format!(
            "{}-{}",
            request.template_id,
            &deployment_id[..deployment_id.len().min(8)]
        );

        let mut labels: Vec<String> = vec![
            format!("{}={}", k8s_label_key(LABEL_TEMPLATE), request.template_id),
            format!("{}={}", k8s_label_key(LABEL_DEPLOYMENT_ID), deployment_id),
            format!("{}={}", k8s_label_key(LABEL_MANAGED_BY), MANAGED_BY_VALUE),
        ];
        if let Some(hash) = &request.config_hash {
            labels.push(format!("{}={}", k8s_label_key(LABEL_CONFIG_HASH), hash));
        }

        let mut args: Vec<String> = vec![
            "run".into(),
            name.clone(),
            "-n".into(),
            self.namespace.clone(),
            format!("--image={}", request.image),
            "--restart=Never".into(),
            format!("--labels={}", labels.join(",")),
        ];
        for (key, value) in &request.env {
            args.push(format!("--env={key}={value}"));
        }
        if let Some(port) = request.port {
            args.push(format!("--port={port}"));
        }
        if !request.args.is_empty() {
            args.push("--".into());
            args.extend(request.args.iter().cloned());
        }

        self.run(&args)
            .await
            .map_err(|stderr| BackendError::DeploymentFailed {
                template: request.template_id.clone(),
                message: stderr,
            })?;

        info!(
            template = %request.template_id,
            %deployment_id,
            pod = %name,
            namespace = %self.namespace,
            "pod created"
        );

        Ok(Deployment {
            deployment_id,
            template_id: request.template_id,
            name,
            status: DeploymentStatus::Pending,
            backend: BackendKind::Kubernetes,
            network: None,
            ports: request
                .port
                .map(|p| vec![PortMapping { host: p, container: p }])
                .unwrap_or_default(),
            created_at,
            labels: HashMap::new(),
            config_hash: request.config_hash,
        })
    }

    pub async fn stop(&self, deployment_id: &str, timeout: Duration) -> BackendResult<()> {
        let pod = self.resolve_pod(deployment_id).await?;
        self.run(&[
            "delete".into(),
            "pod".into(),
            pod,
            "-n".into(),
            self.namespace.clone(),
            format!("--grace-period={}", timeout.as_secs()),
        ])
        .await
        .map(|_| ())
        .map_err(|stderr| BackendError::DeploymentFailed {
            template: deployment_id.to_string(),
            message: format!("kubectl delete failed: {stderr}"),
        })
    }

    pub async fn remove(&self, deployment_id: &str) -> BackendResult<()> {
        // Pods have no stopped-but-present state; delete is removal.
        match self.stop(deployment_id, Duration::from_secs(0)).await {
            Ok(()) => Ok(()),
            Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, template: Option<&str>) -> BackendResult<Vec<Deployment>> {
        let mut selector = format!("{}={}", k8s_label_key(LABEL_MANAGED_BY), MANAGED_BY_VALUE);
        if let Some(template) = template {
            selector.push_str(&format!(",{}={}", k8s_label_key(LABEL_TEMPLATE), template));
        }

        let stdout = self
            .run(&[
                "get".into(),
                "pods".into(),
                "-n".into(),
                self.namespace.clone(),
                "-l".into(),
                selector,
                "-o".into(),
                "json".into(),
            ])
            .await
            .map_err(|stderr| BackendError::Unavailable {
                backend: "kubernetes".into(),
                message: stderr,
            })?;

        let parsed: serde_json::Value =
            serde_json::from_str(&stdout).map_err(|e| BackendError::Unavailable {
                backend: "kubernetes".into(),
                message: format!("unparseable kubectl output: {e}"),
            })?;

        let mut deployments = Vec::new();
        for item in parsed["items"].as_array().into_iter().flatten() {
            match pod_to_deployment(item) {
                Some(d) => deployments.push(d),
                None => warn!("skipping pod without platform labels"),
            }
        }
        Ok(deployments)
    }

    pub async fn logs(&self, deployment_id: &str, options: LogOptions) -> BackendResult<LogStream> {
        let pod = self.resolve_pod(deployment_id).await?;

        let mut args: Vec<String> = vec!["logs".into(), pod, "-n".into(), self.namespace.clone()];
        if let Some(tail) = options.tail {
            args.push(format!("--tail={tail}"));
        }
        if options.follow {
            args.push("-f".into());
        }

        let mut child = Command::new("kubectl")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .spawn()
            .map_err(spawn_error)?;

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                let _ = child.wait().await;
            });
        }
        Ok(rx)
    }

    pub async fn exec(
        &self,
        deployment_id: &str,
        argv: &[String],
        stdin: Option<Vec<u8>>,
    ) -> BackendResult<ExecOutput> {
        let pod = self.resolve_pod(deployment_id).await?;

        let mut args: Vec<String> = vec![
            "exec".into(),
            "-i".into(),
            pod,
            "-n".into(),
            self.namespace.clone(),
            "--".into(),
        ];
        args.extend(argv.iter().cloned());

        let mut child = Command::new("kubectl")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(spawn_error)?;

        if let Some(input) = stdin {
            if let Some(mut child_stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = child_stdin.write_all(&input).await;
                    let _ = child_stdin.shutdown().await;
                });
            }
        } else {
            drop(child.stdin.take());
        }

        let (tx, rx) = mpsc::channel(64);
        let mut stdout = child.stdout.take().expect("stdout was piped");
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let code = child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1);
            let _ = exit_tx.send(code);
        });

        Ok(ExecOutput {
            stdout: rx,
            exit: exit_rx,
        })
    }

    pub async fn cleanup_stopped(&self, template: Option<&str>) -> BackendResult<CleanupReport> {
        let pods = self.list(template).await?;
        let mut removed = Vec::new();
        for pod in pods
            .iter()
            .filter(|d| matches!(d.status, DeploymentStatus::Stopped | DeploymentStatus::Failed))
        {
            match self.remove(&pod.deployment_id).await {
                Ok(()) => removed.push(pod.deployment_id.clone()),
                Err(e) => warn!(deployment_id = %pod.deployment_id, error = %e, "cleanup failed"),
            }
        }
        Ok(CleanupReport { removed })
    }

    async fn resolve_pod(&self, deployment_id: &str) -> BackendResult<String> {
        let stdout = self
            .run(&[
                "get".into(),
                "pods".into(),
                "-n".into(),
                self.namespace.clone(),
                "-l".into(),
                format!("{}={}", k8s_label_key(LABEL_DEPLOYMENT_ID), deployment_id),
                "-o".into(),
                "name".into(),
            ])
            .await
            .map_err(|stderr| BackendError::Unavailable {
                backend: "kubernetes".into(),
                message: stderr,
            })?;

        stdout
            .lines()
            .next()
            .map(|l| l.trim().trim_start_matches("pod/").to_string())
            .filter(|l| !l.is_empty())
            .ok_or_else(|| BackendError::NotFound(deployment_id.to_string()))
    }

    async fn run(&self, args: &[String]) -> Result<String, String> {
        debug!(?args, "kubectl invocation");
        let output = Command::new("kubectl")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to run kubectl: {e}"))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

impl Default for KubernetesBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_error(e: std::io::Error) -> BackendError {
    BackendError::Unavailable {
        backend: "kubernetes".into(),
        message: format!("failed to run kubectl: {e}"),
    }
}

fn pod_to_deployment(item: &serde_json::Value) -> Option<Deployment> {
    let metadata = item.get("metadata")?;
    let raw_labels = metadata.get("labels")?.as_object()?;

    let mut labels = HashMap::new();
    for (key, value) in raw_labels {
        if let Some(value) = value.as_str() {
            // Restore the dotted platform keys.
            let key = if key.starts_with("mcp-") {
                key.replacen("mcp-", "mcp.", 1)
            } else {
                key.clone()
            };
            labels.insert(key, value.to_string());
        }
    }

    let deployment_id = labels.get(LABEL_DEPLOYMENT_ID)?.clone();
    let template_id = labels.get(LABEL_TEMPLATE)?.clone();

    let phase = item["status"]["phase"].as_str().unwrap_or("Unknown");
    let status = match phase {
        "Running" => DeploymentStatus::Running,
        "Pending" => DeploymentStatus::Pending,
        "Succeeded" => DeploymentStatus::Stopped,
        "Failed" => DeploymentStatus::Failed,
        _ => DeploymentStatus::Unhealthy,
    };

    let created_at = metadata["creationTimestamp"]
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(Deployment {
        deployment_id,
        template_id,
        name: metadata["name"].as_str().unwrap_or_default().to_string(),
        status,
        backend: BackendKind::Kubernetes,
        network: None,
        ports: Vec::new(),
        created_at,
        config_hash: labels.get(LABEL_CONFIG_HASH).cloned(),
        labels,
    })
}
