//! Docker backend — drives the docker CLI.
//!
//! Every operation shells out to `docker`; nothing is cached between calls,
//! so the backend reconstructs its view of the world from container labels.
//! Network creation is serialized behind a mutex: two concurrent first
//! deployments must not race to create the shared bridge.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::{BackendError, BackendResult};
use crate::network::{parse_existing, select_subnet, SubnetChoice};
use crate::types::*;

/// Name of the shared bridge network all platform containers join.
pub const PLATFORM_NETWORK: &str = "mcp-platform";

pub struct DockerBackend {
    /// Serializes network ensure/create; the docker CLI races on
    /// `network create` with overlapping subnets.
    network_gate: Mutex<()>,
}

impl DockerBackend {
    pub fn new() -> Self {
        Self {
            network_gate: Mutex::new(()),
        }
    }

    pub async fn deploy(&self, request: DeployRequest) -> BackendResult<Deployment> {
        if request.pull_image {
            self.pull_image(&request.image).await?;
        }

        let network = match &request.network {
            Some(name) => name.clone(),
            None => self.ensure_platform_network().await?,
        };

        let deployment_id = request
            .deployment_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let name = container_name(&request.template_id);
        let created_at = Utc::now();

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "--network".into(),
            network.clone(),
        ];

        for (key, value) in platform_labels(&request, &deployment_id, created_at) {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &request.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(port) = request.port {
            args.push("-p".into());
            args.push(format!("{port}:{port}"));
        }
        for (key, value) in &request.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for mount in &request.mounts {
            args.push("-v".into());
            args.push(mount.to_string());
        }
        args.push(request.image.clone());
        args.extend(request.args.iter().cloned());

        let output = self.run(&args).await;
        match output {
            Ok(_container_id) => {
                info!(
                    template = %request.template_id,
                    deployment_id = %deployment_id,
                    container = %name,
                    "container started"
                );
                Ok(Deployment {
                    deployment_id,
                    template_id: request.template_id,
                    name,
                    status: DeploymentStatus::Running,
                    backend: BackendKind::Docker,
                    network: Some(network),
                    ports: request
                        .port
                        .map(|p| vec![PortMapping { host: p, container: p }])
                        .unwrap_or_default(),
                    created_at,
                    labels: HashMap::new(),
                    config_hash: request.config_hash,
                })
            }
            Err(stderr) => Err(classify_run_error(&request, stderr)),
        }
    }

    pub async fn stop(&self, deployment_id: &str, timeout: Duration) -> BackendResult<()> {
        let container = self.resolve_container(deployment_id).await?;
        let secs = timeout.as_secs().max(1).to_string();
        self.run(&["stop".into(), "-t".into(), secs, container])
            .await
            .map_err(|stderr| BackendError::DeploymentFailed {
                template: deployment_id.to_string(),
                message: format!("docker stop failed: {stderr}"),
            })?;
        debug!(%deployment_id, "container stopped");
        Ok(())
    }

    pub async fn remove(&self, deployment_id: &str) -> BackendResult<()> {
        let container = self.resolve_container(deployment_id).await?;
        self.run(&["rm".into(), "-f".into(), container])
            .await
            .map_err(|stderr| BackendError::DeploymentFailed {
                template: deployment_id.to_string(),
                message: format!("docker rm failed: {stderr}"),
            })?;
        debug!(%deployment_id, "container removed");
        Ok(())
    }

    pub async fn list(&self, template: Option<&str>) -> BackendResult<Vec<Deployment>> {
        let mut args: Vec<String> = vec![
            "ps".into(),
            "-a".into(),
            "--no-trunc".into(),
            "--filter".into(),
            format!("label={LABEL_MANAGED_BY}={MANAGED_BY_VALUE}"),
        ];
        if let Some(template) = template {
            args.push("--filter".into());
            args.push(format!("label={LABEL_TEMPLATE}={template}"));
        }
        args.push("--format".into());
        args.push("{{json .}}".into());

        let stdout = self.run(&args).await.map_err(|stderr| {
            BackendError::Unavailable {
                backend: "docker".into(),
                message: stderr,
            }
        })?;

        let mut deployments = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<PsRow>(line) {
                Ok(row) => deployments.push(row.into_deployment()),
                Err(e) => warn!(error = %e, line, "skipping unparseable docker ps row"),
            }
        }
        Ok(deployments)
    }

    pub async fn logs(&self, deployment_id: &str, options: LogOptions) -> BackendResult<LogStream> {
        let container = self.resolve_container(deployment_id).await?;

        let mut args: Vec<String> = vec!["logs".into()];
        if let Some(tail) = options.tail {
            args.push("--tail".into());
            args.push(tail.to_string());
        }
        if options.follow {
            args.push("-f".into());
        }
        args.push(container);

        let mut child = Command::new("docker")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(spawn_error)?;

        let (tx, rx) = mpsc::channel(256);
        // docker writes container stdout and stderr to matching streams;
        // merge both into one line stream.
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(rx)
    }

    pub async fn exec(
        &self,
        deployment_id: &str,
        argv: &[String],
        stdin: Option<Vec<u8>>,
    ) -> BackendResult<ExecOutput> {
        let container = self.resolve_container(deployment_id).await?;

        let mut args: Vec<String> = vec!["exec".into(), "-i".into(), container];
        args.extend(argv.iter().cloned());

        let mut child = Command::new("docker")
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
        let mut args: Vec<String> = vec![
            "ps".into(),
            "-aq".into(),
            "--filter".into(),
            "status=exited".into(),
            "--filter".into(),
            format!("label={LABEL_MANAGED_BY}={MANAGED_BY_VALUE}"),
        ];
        if let Some(template) = template {
            args.push("--filter".into());
            args.push(format!("label={LABEL_TEMPLATE}={template}"));
        }

        let stdout = self.run(&args).await.map_err(|stderr| {
            BackendError::Unavailable {
                backend: "docker".into(),
                message: stderr,
            }
        })?;

        let ids: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(CleanupReport::default());
        }

        let mut rm_args: Vec<String> = vec!["rm".into()];
        rm_args.extend(ids.iter().cloned());
        self.run(&rm_args)
            .await
            .map_err(|stderr| BackendError::DeploymentFailed {
                template: template.unwrap_or("*").to_string(),
                message: format!("docker rm failed: {stderr}"),
            })?;
        info!(count = ids.len(), "removed stopped containers");
        Ok(CleanupReport { removed: ids })
    }

    /// Ensure the shared bridge network exists, allocating a free subnet on
    /// first use. Serialized: concurrent first deployments would otherwise
    /// race the create.
    async fn ensure_platform_network(&self) -> BackendResult<String> {
        let _gate = self.network_gate.lock().await;

        let names = self
            .run(&["network".into(), "ls".into(), "--format".into(), "{{.Name}}".into()])
            .await
            .map_err(|stderr| BackendError::Unavailable {
                backend: "docker".into(),
                message: stderr,
            })?;
        if names.lines().any(|n| n.trim() == PLATFORM_NETWORK) {
            return Ok(PLATFORM_NETWORK.to_string());
        }

        let existing = self.existing_subnets(&names).await?;
        let preferred = std::env::var("MCP_SUBNET").ok();
        let choice = select_subnet(&parse_existing(&existing), preferred.as_deref());

        let mut args: Vec<String> = vec![
            "network".into(),
            "create".into(),
            "--driver".into(),
            "bridge".into(),
        ];
        if let SubnetChoice::Subnet(subnet) = choice {
            args.push("--subnet".into());
            args.push(subnet.to_string());
            info!(subnet = %subnet, network = PLATFORM_NETWORK, "creating platform network");
        } else {
            info!(network = PLATFORM_NETWORK, "creating platform network without explicit IPAM");
        }
        args.push(PLATFORM_NETWORK.into());

        match self.run(&args).await {
            Ok(_) => Ok(PLATFORM_NETWORK.to_string()),
            Err(stderr) if stderr.contains("already exists") => Ok(PLATFORM_NETWORK.to_string()),
            Err(stderr) if matches!(choice, SubnetChoice::Subnet(_)) => {
                // Subnet raced with another network; retry without IPAM
                // rather than failing the deployment.
                warn!(error = %stderr, "IPAM network create failed, retrying without subnet");
                self.run(&[
                    "network".into(),
                    "create".into(),
                    "--driver".into(),
                    "bridge".into(),
                    PLATFORM_NETWORK.into(),
                ])
                .await
                .map_err(BackendError::NetworkAllocationFailed)?;
                Ok(PLATFORM_NETWORK.to_string())
            }
            Err(stderr) => Err(BackendError::NetworkAllocationFailed(stderr)),
        }
    }

    async fn existing_subnets(&self, network_names: &str) -> BackendResult<Vec<String>> {
        let names: Vec<String> = network_names
            .lines()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut args: Vec<String> = vec![
            "network".into(),
            "inspect".into(),
            "--format".into(),
            "{{range .IPAM.Config}}{{.Subnet}}\n{{end}}".into(),
        ];
        args.extend(names);

        match self.run(&args).await {
            Ok(stdout) => Ok(stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(stderr) => {
                warn!(error = %stderr, "network inspect failed, assuming no existing subnets");
                Ok(Vec::new())
            }
        }
    }

    async fn pull_image(&self, image: &str) -> BackendResult<()> {
        self.run(&["pull".into(), image.into()])
            .await
            .map(|_| ())
            .map_err(|stderr| BackendError::ImagePullFailed {
                image: image.to_string(),
                message: stderr,
            })
    }

    /// Map a deployment id to its container id via the label filter.
    async fn resolve_container(&self, deployment_id: &str) -> BackendResult<String> {
        let stdout = self
            .run(&[
                "ps".into(),
                "-aq".into(),
                "--no-trunc".into(),
                "--filter".into(),
                format!("label={LABEL_DEPLOYMENT_ID}={deployment_id}"),
            ])
            .await
            .map_err(|stderr| BackendError::Unavailable {
                backend: "docker".into(),
                message: stderr,
            })?;

        stdout
            .lines()
            .next()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .ok_or_else(|| BackendError::NotFound(deployment_id.to_string()))
    }

    /// Run docker with the given args; Ok(stdout) on success, Err(stderr)
    /// otherwise.
    async fn run(&self, args: &[String]) -> Result<String, String> {
        debug!(?args, "docker invocation");
        let output = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to run docker: {e}"))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_error(e: std::io::Error) -> BackendError {
    BackendError::Unavailable {
        backend: "docker".into(),
        message: format!("failed to run docker: {e}"),
    }
}

fn forward_lines(stream: impl tokio::io::AsyncRead + Unpin + Send + 'static, tx: mpsc::Sender<String>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

fn classify_run_error(request: &DeployRequest, stderr: String) -> BackendError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("port is already allocated") || lowered.contains("address already in use") {
        BackendError::PortBindFailed {
            port: request.port.unwrap_or(0),
            message: stderr,
        }
    } else if lowered.contains("pull access denied")
        || lowered.contains("manifest unknown")
        || lowered.contains("no such image")
    {
        BackendError::ImagePullFailed {
            image: request.image.clone(),
            message: stderr,
        }
    } else {
        BackendError::DeploymentFailed {
            template: request.template_id.clone(),
            message: stderr,
        }
    }
}

/// Container names embed the template id plus a short random suffix; the
/// deployment id label, not the name, carries identity.
fn container_name(template_id: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{template_id}-{suffix}")
}

/// The platform-owned label set for a new container.
fn platform_labels(
    request: &DeployRequest,
    deployment_id: &str,
    created_at: DateTime<Utc>,
) -> Vec<(String, String)> {
    let mut labels = vec![
        (LABEL_TEMPLATE.to_string(), request.template_id.clone()),
        (LABEL_DEPLOYMENT_ID.to_string(), deployment_id.to_string()),
        (LABEL_CREATED_AT.to_string(), created_at.to_rfc3339()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
    ];
    if let Some(hash) = &request.config_hash {
        labels.push((LABEL_CONFIG_HASH.to_string(), hash.clone()));
    }
    labels
}

/// One row of `docker ps --format '{{json .}}'`.
#[derive(Debug, serde::Deserialize)]
struct PsRow {
    #[serde(rename = "ID")]
    _id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Ports", default)]
    ports: String,
    #[serde(rename = "Networks", default)]
    networks: String,
}

impl PsRow {
    fn into_deployment(self) -> Deployment {
        let labels = parse_label_list(&self.labels);
        let created_at = labels
            .get(LABEL_CREATED_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Deployment {
            deployment_id: labels
                .get(LABEL_DEPLOYMENT_ID)
                .cloned()
                .unwrap_or_default(),
            template_id: labels.get(LABEL_TEMPLATE).cloned().unwrap_or_default(),
            name: self.names,
            status: parse_container_status(&self.status),
            backend: BackendKind::Docker,
            network: self
                .networks
                .split(',')
                .next()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            ports: parse_port_list(&self.ports),
            created_at,
            config_hash: labels.get(LABEL_CONFIG_HASH).cloned(),
            labels,
        }
    }
}

fn parse_label_list(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn parse_container_status(raw: &str) -> DeploymentStatus {
    if raw.starts_with("Up") {
        if raw.contains("(unhealthy)") {
            DeploymentStatus::Unhealthy
        } else {
            DeploymentStatus::Running
        }
    } else if raw.starts_with("Exited") {
        DeploymentStatus::Stopped
    } else if raw.starts_with("Created") {
        DeploymentStatus::Pending
    } else if raw.starts_with("Restarting") {
        DeploymentStatus::Unhealthy
    } else {
        DeploymentStatus::Failed
    }
}

/// Parse `docker ps` port strings like
/// `0.0.0.0:18080->8080/tcp, :::18080->8080/tcp`.
fn parse_port_list(raw: &str) -> Vec<PortMapping> {
    let mut ports = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        let Some((host_side, container_side)) = part.split_once("->") else {
            continue;
        };
        let Some(host) = host_side
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        let Some(container) = container_side
            .split('/')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        let mapping = PortMapping { host, container };
        if !ports.contains(&mapping) {
            ports.push(mapping);
        }
    }
    ports
}
