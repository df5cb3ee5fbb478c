//! Deployment orchestration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mcpgrid_backend::{
    Backend, BackendError, DeployRequest, Deployment, DeploymentStatus,
};
use mcpgrid_config::{process, ConfigLayers, ProcessedConfig, VolumeMount};
use mcpgrid_template::{TemplateDescriptor, TemplateRegistry};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::DeployResult;

/// Default grace given to a container on stop.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Looks up the gateway's most recent health verdict for a deployment:
/// `Some(true)` healthy, `Some(false)` unhealthy, `None` not registered.
pub type GatewayHealth = Arc<dyn Fn(&str) -> Option<bool> + Send + Sync>;

/// Caller-tunable knobs for one deploy.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Publish this port instead of the template's declared one.
    pub port: Option<u16>,
    /// Explicit deployment id for idempotent redeploys.
    pub deployment_id: Option<String>,
    /// Validate and plan without touching the backend.
    pub dry_run: bool,
    pub pull_image: bool,
    /// Attach to an existing network instead of the shared platform one.
    pub network: Option<String>,
}

/// What a dry run would do.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPlan {
    pub template_id: String,
    pub image: String,
    /// Sensitive values are redacted; this plan is meant to be shown.
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<VolumeMount>,
    pub args: Vec<String>,
    pub port: Option<u16>,
    pub network: Option<String>,
    pub config_hash: String,
}

/// Result of a deploy call.
#[derive(Debug, Clone)]
pub enum DeployOutcome {
    /// A container was created.
    Deployed(Deployment),
    /// An identical deployment was already running; nothing happened.
    Unchanged(Deployment),
    /// Dry run: the rendered plan.
    Plan(DeploymentPlan),
}

pub struct DeploymentManager {
    registry: Arc<TemplateRegistry>,
    backend: Arc<Backend>,
    gateway_health: Option<GatewayHealth>,
}

impl DeploymentManager {
    pub fn new(registry: Arc<TemplateRegistry>, backend: Arc<Backend>) -> Self {
        Self {
            registry,
            backend,
            gateway_health: None,
        }
    }

    /// Fold the gateway's probe results into reported statuses.
    pub fn with_gateway_health(mut self, health: GatewayHealth) -> Self {
        self.gateway_health = Some(health);
        self
    }

    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Deploy a template with the given config layers.
    ///
    /// With an explicit deployment id, redeploying the same
    /// `(template, config hash)` is a no-op while a matching deployment is
    /// running; a changed config stops the old container before starting
    /// the new one.
    pub async fn deploy(
        &self,
        template_id: &str,
        layers: &ConfigLayers,
        options: DeployOptions,
    ) -> DeployResult<DeployOutcome> {
        let template = self.registry.get(template_id)?;
        let processed = process(&template, layers)?;
        let config_hash = config_hash(&processed);
        let port = options.port.or(template.port);

        if options.dry_run {
            return Ok(DeployOutcome::Plan(self.plan(
                &template, &processed, port, &options, config_hash,
            )));
        }

        if let Some(explicit_id) = &options.deployment_id {
            if let Some(existing) = self.find_deployment(explicit_id).await? {
                if existing.status == DeploymentStatus::Running
                    && existing.config_hash.as_deref() == Some(config_hash.as_str())
                {
                    debug!(
                        deployment_id = %explicit_id,
                        template = %template_id,
                        "identical deployment already running, skipping"
                    );
                    return Ok(DeployOutcome::Unchanged(existing));
                }
                // Stop-then-start; atomic from the caller's point of view.
                self.backend.stop(explicit_id, STOP_TIMEOUT).await?;
                self.backend.remove(explicit_id).await?;
            }
        }

        let request = DeployRequest {
            template_id: template.id.clone(),
            image: template.image.clone(),
            env: platform_env(&template, &processed),
            mounts: processed.volumes.clone(),
            args: processed.args.clone(),
            network: options.network.clone(),
            port,
            deployment_id: options.deployment_id.clone(),
            config_hash: Some(config_hash),
            pull_image: options.pull_image,
            labels: Default::default(),
        };

        let deployment = self.backend.deploy(request).await?;
        info!(
            template = %template_id,
            deployment_id = %deployment.deployment_id,
            backend = %deployment.backend,
            "deployed"
        );
        Ok(DeployOutcome::Deployed(deployment))
    }

    /// Stop a deployment. Idempotent on already-stopped deployments.
    pub async fn stop(&self, deployment_id: &str, timeout: Option<Duration>) -> DeployResult<()> {
        self.backend
            .stop(deployment_id, timeout.unwrap_or(STOP_TIMEOUT))
            .await?;
        Ok(())
    }

    /// Stop a deployment and bring it back with the given layers under the
    /// same identity.
    pub async fn restart(
        &self,
        deployment_id: &str,
        layers: &ConfigLayers,
    ) -> DeployResult<DeployOutcome> {
        let existing = self
            .find_deployment(deployment_id)
            .await?
            .ok_or_else(|| BackendError::NotFound(deployment_id.to_string()))?;

        self.backend.stop(deployment_id, STOP_TIMEOUT).await?;
        self.backend.remove(deployment_id).await?;
        self.deploy(
            &existing.template_id,
            layers,
            DeployOptions {
                deployment_id: Some(deployment_id.to_string()),
                port: existing.ports.first().map(|p| p.host),
                ..Default::default()
            },
        )
        .await
    }

    /// All deployments, with gateway health folded into the status.
    pub async fn list(&self, template: Option<&str>) -> DeployResult<Vec<Deployment>> {
        let mut deployments = self.backend.list(template).await?;
        for deployment in &mut deployments {
            deployment.status = self.aggregate_status(deployment);
        }
        Ok(deployments)
    }

    /// A single deployment's aggregated status.
    pub async fn status(&self, deployment_id: &str) -> DeployResult<Deployment> {
        let deployment = self
            .find_deployment(deployment_id)
            .await?
            .ok_or_else(|| BackendError::NotFound(deployment_id.to_string()))?;
        let mut deployment = deployment;
        deployment.status = self.aggregate_status(&deployment);
        Ok(deployment)
    }

    async fn find_deployment(&self, deployment_id: &str) -> DeployResult<Option<Deployment>> {
        Ok(self
            .backend
            .list(None)
            .await?
            .into_iter()
            .find(|d| d.deployment_id == deployment_id))
    }

    /// Reported status is the worst of what the backend and the gateway see.
    fn aggregate_status(&self, deployment: &Deployment) -> DeploymentStatus {
        let backend_status = deployment.status;
        if backend_status != DeploymentStatus::Running {
            return backend_status;
        }
        match self
            .gateway_health
            .as_ref()
            .and_then(|lookup| lookup(&deployment.deployment_id))
        {
            Some(false) => DeploymentStatus::Unhealthy,
            _ => backend_status,
        }
    }

    fn plan(
        &self,
        template: &TemplateDescriptor,
        processed: &ProcessedConfig,
        port: Option<u16>,
        options: &DeployOptions,
        config_hash: String,
    ) -> DeploymentPlan {
        // Redact env values that came from sensitive properties.
        let sensitive_env: Vec<String> = template
            .config_schema
            .iter_properties()
            .filter(|(name, prop)| prop.sensitive || processed.sensitive.contains(*name))
            .filter_map(|(_, prop)| prop.env_mapping)
            .collect();

        let env = platform_env(template, processed)
            .into_iter()
            .map(|(key, value)| {
                if sensitive_env.contains(&key) {
                    (key, "***".to_string())
                } else {
                    (key, value)
                }
            })
            .collect();

        DeploymentPlan {
            template_id: template.id.clone(),
            image: template.image.clone(),
            env,
            mounts: processed.volumes.clone(),
            args: processed.args.clone(),
            port,
            network: options.network.clone(),
            config_hash,
        }
    }
}

/// The container environment: the processor's `env_mapping` output plus the
/// platform identity variables.
fn platform_env(
    template: &TemplateDescriptor,
    processed: &ProcessedConfig,
) -> BTreeMap<String, String> {
    let mut env = processed.env.clone();
    env.insert("MCP_TEMPLATE_ID".into(), template.id.clone());
    env.insert(
        "MCP_TRANSPORT".into(),
        template.transport.default.to_string(),
    );
    env
}

/// Stable hash of the resolved config snapshot.
fn config_hash(processed: &ProcessedConfig) -> String {
    let canonical =
        serde_json::to_vec(&processed.values).expect("config values always serialize");
    let digest = Sha256::digest(&canonical);
    // First 16 hex chars are plenty for identity comparison.
    digest
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with_demo() -> (Arc<TemplateRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let template_dir = dir.path().join("demo");
        std::fs::create_dir_all(&template_dir).unwrap();
        std::fs::write(
            template_dir.join("template.json"),
            serde_json::to_string(&json!({
                "id": "demo",
                "name": "Demo",
                "version": "1.0.0",
                "image": "example/demo:latest",
                "port": 7007,
                "transport": {"default": "http", "supported": ["http", "stdio"]},
                "config_schema": {
                    "type": "object",
                    "properties": {
                        "greeting": {"type": "string", "default": "hello", "env_mapping": "GREETING"},
                        "api_key": {"type": "string", "sensitive": true, "env_mapping": "API_KEY"},
                    }
                }
            }))
            .unwrap(),
        )
        .unwrap();
        let registry = Arc::new(TemplateRegistry::load(dir.path()).unwrap());
        (registry, dir)
    }

    fn manager() -> (DeploymentManager, tempfile::TempDir) {
        let (registry, dir) = registry_with_demo();
        (
            DeploymentManager::new(registry, Arc::new(Backend::by_name("mock").unwrap())),
            dir,
        )
    }

    fn deployed(outcome: DeployOutcome) -> Deployment {
        match outcome {
            DeployOutcome::Deployed(d) => d,
            other => panic!("expected Deployed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deploy_then_list_then_stop() {
        let (manager, _dir) = manager();
        let d = deployed(
            manager
                .deploy("demo", &ConfigLayers::new(), DeployOptions::default())
                .await
                .unwrap(),
        );

        let listed = manager.list(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].deployment_id, d.deployment_id);
        assert_eq!(listed[0].status, DeploymentStatus::Running);
        assert_eq!(listed[0].ports.first().map(|p| p.host), Some(7007));

        manager.stop(&d.deployment_id, None).await.unwrap();
        let listed = manager.list(None).await.unwrap();
        assert_eq!(listed[0].status, DeploymentStatus::Stopped);

        // Stop is idempotent.
        manager.stop(&d.deployment_id, None).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_template_is_an_input_error() {
        let (manager, _dir) = manager();
        let err = manager
            .deploy("ghost", &ConfigLayers::new(), DeployOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::DeployError::Template(_)));
    }

    #[tokio::test]
    async fn redeploy_with_same_config_is_a_no_op() {
        let (manager, _dir) = manager();
        let options = DeployOptions {
            deployment_id: Some("fixed".into()),
            ..Default::default()
        };

        let first = deployed(
            manager
                .deploy("demo", &ConfigLayers::new(), options.clone())
                .await
                .unwrap(),
        );
        let second = manager
            .deploy("demo", &ConfigLayers::new(), options)
            .await
            .unwrap();
        match second {
            DeployOutcome::Unchanged(d) => assert_eq!(d.deployment_id, first.deployment_id),
            other => panic!("expected Unchanged, got {other:?}"),
        }
        assert_eq!(manager.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn redeploy_with_changed_config_replaces() {
        let (manager, _dir) = manager();
        let options = DeployOptions {
            deployment_id: Some("fixed".into()),
            ..Default::default()
        };

        manager
            .deploy("demo", &ConfigLayers::new(), options.clone())
            .await
            .unwrap();
        let second = manager
            .deploy(
                "demo",
                &ConfigLayers::new().with_cli("greeting", "hola"),
                options,
            )
            .await
            .unwrap();

        let d = deployed(second);
        assert_eq!(d.deployment_id, "fixed");
        let listed = manager.list(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn dry_run_returns_plan_with_redacted_secrets() {
        let (manager, _dir) = manager();
        let outcome = manager
            .deploy(
                "demo",
                &ConfigLayers::new().with_cli("api_key", "s3cret"),
                DeployOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let plan = match outcome {
            DeployOutcome::Plan(plan) => plan,
            other => panic!("expected Plan, got {other:?}"),
        };
        assert_eq!(plan.image, "example/demo:latest");
        assert_eq!(plan.port, Some(7007));
        assert_eq!(plan.env["API_KEY"], "***");
        assert_eq!(plan.env["GREETING"], "hello");
        assert_eq!(plan.env["MCP_TEMPLATE_ID"], "demo");

        // Nothing was deployed.
        assert!(manager.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_aggregates_gateway_health_as_worst_of() {
        let (manager, _dir) = manager();
        let manager = manager.with_gateway_health(Arc::new(|_| Some(false)));
        let d = deployed(
            manager
                .deploy("demo", &ConfigLayers::new(), DeployOptions::default())
                .await
                .unwrap(),
        );

        let status = manager.status(&d.deployment_id).await.unwrap();
        assert_eq!(status.status, DeploymentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn restart_keeps_identity() {
        let (manager, _dir) = manager();
        let d = deployed(
            manager
                .deploy(
                    "demo",
                    &ConfigLayers::new(),
                    DeployOptions {
                        deployment_id: Some("keep-me".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap(),
        );

        let restarted = deployed(
            manager
                .restart(&d.deployment_id, &ConfigLayers::new())
                .await
                .unwrap(),
        );
        assert_eq!(restarted.deployment_id, "keep-me");
        assert_eq!(restarted.status, DeploymentStatus::Running);
    }

    #[test]
    fn config_hash_is_stable_and_sensitive_to_values() {
        let (registry, _dir) = registry_with_demo();
        let template = registry.get("demo").unwrap();

        let a = process(&template, &ConfigLayers::new()).unwrap();
        let b = process(&template, &ConfigLayers::new()).unwrap();
        let c = process(
            &template,
            &ConfigLayers::new().with_cli("greeting", "hola"),
        )
        .unwrap();

        assert_eq!(config_hash(&a), config_hash(&b));
        assert_ne!(config_hash(&a), config_hash(&c));
    }
}
