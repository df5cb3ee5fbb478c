//! Routing state: `{template → instances + policy}`, persisted as one JSON
//! document with write-temp-then-rename replacement.
//!
//! Mutations go through an exclusive lock, are applied to a copy, persisted,
//! and only then committed — a failed write leaves memory and disk agreeing
//! on the prior state. Health updates are the one exception: losing a probe
//! result to a disk hiccup is not worth failing the probe, so those log and
//! carry on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use mcpgrid_template::Transport;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, GatewayResult};

/// Health state of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Load-balancing strategy for a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    Weighted,
    HealthBased,
    Random,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::Weighted => "weighted",
            Strategy::HealthBased => "health_based",
            Strategy::Random => "random",
        };
        write!(f, "{name}")
    }
}

/// Per-template routing policy, with the limits enforced at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "Policy::default_strategy")]
    pub strategy: Strategy,
    /// Seconds between health probes (5–300).
    #[serde(default = "Policy::default_check_interval")]
    pub check_interval: u64,
    /// Forwarding retries (1–10).
    #[serde(default = "Policy::default_max_retries")]
    pub max_retries: u32,
    /// stdio children kept per instance (1–20).
    #[serde(default = "Policy::default_pool_size")]
    pub pool_size: usize,
    /// Per-request wall clock in seconds (5–300).
    #[serde(default = "Policy::default_timeout")]
    pub timeout: u64,
}

impl Policy {
    fn default_strategy() -> Strategy {
        Strategy::RoundRobin
    }
    fn default_check_interval() -> u64 {
        30
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_pool_size() -> usize {
        3
    }
    fn default_timeout() -> u64 {
        60
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(5..=300).contains(&self.check_interval) {
            return Err(format!(
                "check_interval {} outside 5..=300",
                self.check_interval
            ));
        }
        if !(1..=10).contains(&self.max_retries) {
            return Err(format!("max_retries {} outside 1..=10", self.max_retries));
        }
        if !(1..=20).contains(&self.pool_size) {
            return Err(format!("pool_size {} outside 1..=20", self.pool_size));
        }
        if !(5..=300).contains(&self.timeout) {
            return Err(format!("timeout {} outside 5..=300", self.timeout));
        }
        Ok(())
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            strategy: Self::default_strategy(),
            check_interval: Self::default_check_interval(),
            max_retries: Self::default_max_retries(),
            pool_size: Self::default_pool_size(),
            timeout: Self::default_timeout(),
        }
    }
}

/// A deployment registered for routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub template_id: String,
    pub transport: Transport,
    /// Base URL for http instances.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Exec spec for stdio instances.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default = "Instance::default_status")]
    pub status: InstanceStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default = "Instance::default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Instance {
    fn default_status() -> InstanceStatus {
        InstanceStatus::Unknown
    }
    fn default_weight() -> u32 {
        1
    }

    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Healthy
    }
}

/// One template's routing entry. Unknown fields survive a load/store cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRouting {
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub policy: Policy,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDoc {
    #[serde(default)]
    pub templates: HashMap<String, TemplateRouting>,
    #[serde(default)]
    pub version: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Aggregate view for `/gateway/registry` and `/gateway/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_templates: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub templates: HashMap<String, TemplateStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub strategy: Strategy,
}

/// The gateway's mutable shared structure. Readers get consistent
/// snapshots; writers hold the exclusive lock across the mutation and the
/// persistence write.
pub struct GatewayRegistry {
    state: RwLock<RegistryDoc>,
    path: Option<PathBuf>,
}

impl GatewayRegistry {
    /// In-memory only (tests, ephemeral gateways).
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(RegistryDoc::default()),
            path: None,
        }
    }

    /// File-backed; loads the existing document if present. A corrupt file
    /// is an error — silently starting empty would orphan live routing
    /// state.
    pub fn open(path: impl Into<PathBuf>) -> GatewayResult<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| GatewayError::Persistence(format!("read {}: {e}", path.display())))?;
            serde_json::from_str(&raw)
                .map_err(|e| GatewayError::Persistence(format!("parse {}: {e}", path.display())))?
        } else {
            info!(path = %path.display(), "no registry file yet, starting empty");
            RegistryDoc::default()
        };
        let templates = doc.templates.len();
        let registry = Self {
            state: RwLock::new(doc),
            path: Some(path),
        };
        debug!(templates, "gateway registry loaded");
        Ok(registry)
    }

    /// Register (or replace) an instance under a template.
    pub fn register(
        &self,
        template_id: &str,
        mut instance: Instance,
        policy: Option<Policy>,
    ) -> GatewayResult<()> {
        if let Some(policy) = &policy {
            policy.validate().map_err(GatewayError::BadRequest)?;
        }
        instance.template_id = template_id.to_string();

        let mut state = self.state.write().expect("registry lock");
        let mut next = state.clone();
        let routing = next
            .templates
            .entry(template_id.to_string())
            .or_insert_with(|| TemplateRouting {
                instances: Vec::new(),
                policy: policy.clone().unwrap_or_default(),
                extra: Map::new(),
            });
        if let Some(policy) = policy {
            routing.policy = policy;
        }
        routing.instances.retain(|i| i.id != instance.id);
        let instance_id = instance.id.clone();
        routing.instances.push(instance);
        next.version += 1;

        self.persist(&next)?;
        *state = next;
        info!(template = template_id, instance = %instance_id, "instance registered");
        Ok(())
    }

    /// Remove an instance; empty templates disappear with it.
    pub fn deregister(&self, template_id: &str, instance_id: &str) -> GatewayResult<bool> {
        let mut state = self.state.write().expect("registry lock");
        let mut next = state.clone();

        let Some(routing) = next.templates.get_mut(template_id) else {
            return Ok(false);
        };
        let before = routing.instances.len();
        routing.instances.retain(|i| i.id != instance_id);
        let removed = routing.instances.len() < before;
        if !removed {
            return Ok(false);
        }
        if routing.instances.is_empty() {
            next.templates.remove(template_id);
        }
        next.version += 1;

        self.persist(&next)?;
        *state = next;
        info!(template = template_id, instance = instance_id, "instance deregistered");
        Ok(true)
    }

    /// Record a probe outcome, applying the failure/success thresholds.
    /// Returns the new status, or `None` if the instance is unknown.
    /// Persistence failures here are logged, not fatal.
    pub fn update_health(
        &self,
        template_id: &str,
        instance_id: &str,
        probe_succeeded: bool,
        max_consecutive_failures: u32,
        min_consecutive_successes: u32,
    ) -> Option<(InstanceStatus, InstanceStatus)> {
        let mut state = self.state.write().expect("registry lock");
        let routing = state.templates.get_mut(template_id)?;
        let instance = routing.instances.iter_mut().find(|i| i.id == instance_id)?;

        let previous = instance.status;
        if probe_succeeded {
            instance.consecutive_failures = 0;
            instance.consecutive_successes += 1;
            if instance.consecutive_successes >= min_consecutive_successes {
                instance.status = InstanceStatus::Healthy;
            }
        } else {
            instance.consecutive_successes = 0;
            instance.consecutive_failures += 1;
            if instance.consecutive_failures >= max_consecutive_failures {
                instance.status = InstanceStatus::Unhealthy;
            }
        }
        instance.last_check = Some(Utc::now());
        let current = instance.status;
        state.version += 1;

        if let Err(e) = self.persist(&state) {
            warn!(error = %e, "health-state persistence failed (non-fatal)");
        }
        Some((previous, current))
    }

    /// Consistent copy of the whole document.
    pub fn snapshot(&self) -> RegistryDoc {
        self.state.read().expect("registry lock").clone()
    }

    pub fn routing(&self, template_id: &str) -> Option<TemplateRouting> {
        self.state
            .read()
            .expect("registry lock")
            .templates
            .get(template_id)
            .cloned()
    }

    pub fn healthy_instances(&self, template_id: &str) -> Vec<Instance> {
        self.routing(template_id)
            .map(|r| r.instances.into_iter().filter(Instance::is_healthy).collect())
            .unwrap_or_default()
    }

    pub fn instance(&self, template_id: &str, instance_id: &str) -> Option<Instance> {
        self.routing(template_id)?
            .instances
            .into_iter()
            .find(|i| i.id == instance_id)
    }

    /// Latest health verdict for a deployment id, if registered.
    pub fn deployment_health(&self, deployment_id: &str) -> Option<bool> {
        let state = self.state.read().expect("registry lock");
        state
            .templates
            .values()
            .flat_map(|r| r.instances.iter())
            .find(|i| i.deployment_id.as_deref() == Some(deployment_id))
            .map(|i| i.status != InstanceStatus::Unhealthy)
    }

    /// Drop instances whose consecutive failures reached `max_failures`.
    pub fn clear_unhealthy(&self, max_failures: u32) -> GatewayResult<usize> {
        let mut state = self.state.write().expect("registry lock");
        let mut next = state.clone();
        let mut removed = 0;

        next.templates.retain(|template_id, routing| {
            let before = routing.instances.len();
            routing
                .instances
                .retain(|i| i.consecutive_failures < max_failures);
            let dropped = before - routing.instances.len();
            if dropped > 0 {
                removed += dropped;
                info!(template = template_id, dropped, "evicted chronically failing instances");
            }
            !routing.instances.is_empty()
        });

        if removed == 0 {
            return Ok(0);
        }
        next.version += 1;
        self.persist(&next)?;
        *state = next;
        Ok(removed)
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read().expect("registry lock");
        let mut templates = HashMap::new();
        let mut total = 0;
        let mut healthy = 0;
        for (id, routing) in &state.templates {
            let h = routing.instances.iter().filter(|i| i.is_healthy()).count();
            total += routing.instances.len();
            healthy += h;
            templates.insert(
                id.clone(),
                TemplateStats {
                    total_instances: routing.instances.len(),
                    healthy_instances: h,
                    strategy: routing.policy.strategy,
                },
            );
        }
        RegistryStats {
            total_templates: state.templates.len(),
            total_instances: total,
            healthy_instances: healthy,
            unhealthy_instances: total - healthy,
            templates,
        }
    }

    /// Atomic write: temp file in the same directory, then rename over.
    fn persist(&self, doc: &RegistryDoc) -> GatewayResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::Persistence(format!("mkdir {}: {e}", parent.display())))?;
        }

        let tmp = temp_path(path);
        let payload = serde_json::to_vec_pretty(doc)
            .map_err(|e| GatewayError::Persistence(format!("serialize: {e}")))?;
        std::fs::write(&tmp, payload)
            .map_err(|e| GatewayError::Persistence(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            error!(path = %path.display(), error = %e, "registry rename failed");
            GatewayError::Persistence(format!("rename {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "registry persisted");
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
