//! Periodic health probing.
//!
//! One lightweight loop per registered instance, reconciled from the
//! registry a few times per interval. Each instance's first probe is
//! delayed by a uniform random offset inside its interval so a freshly
//! started gateway does not hammer every backend at once; after that,
//! probes are spaced by the interval. Probe concurrency across instances
//! is bounded by a semaphore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcpgrid_template::Transport;
use rand::Rng;
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mcpgrid_mcp::{StdioConnection, StdioSpawn};

use crate::balancer::LoadBalancer;
use crate::registry::{GatewayRegistry, Instance, InstanceStatus};

#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Global cap on the probe interval; per-template policies can ask for
    /// more frequent checks but not slower than this.
    pub check_interval: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent_checks: usize,
    pub max_consecutive_failures: u32,
    pub min_consecutive_successes: u32,
    /// Path appended to an http instance's endpoint.
    pub health_path: String,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_concurrent_checks: 10,
            max_consecutive_failures: 3,
            min_consecutive_successes: 1,
            health_path: "/health".to_string(),
        }
    }
}

/// Emitted on every healthy/unhealthy transition.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub template_id: String,
    pub instance_id: String,
    pub previous: InstanceStatus,
    pub current: InstanceStatus,
}

struct CheckerInner {
    registry: Arc<GatewayRegistry>,
    balancer: Arc<LoadBalancer>,
    config: HealthCheckerConfig,
    client: reqwest::Client,
    semaphore: Semaphore,
    events: broadcast::Sender<HealthEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Drives the probe loops. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<CheckerInner>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<GatewayRegistry>,
        balancer: Arc<LoadBalancer>,
        config: HealthCheckerConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .expect("reqwest client construction is infallible with these options");
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(CheckerInner {
                semaphore: Semaphore::new(config.max_concurrent_checks),
                registry,
                balancer,
                config,
                client,
                events,
                shutdown,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.events.subscribe()
    }

    /// Start the reconcile driver; a second call is a no-op.
    pub async fn start(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.contains_key("__driver__") {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.inner.shutdown.subscribe();
        tasks.insert(
            "__driver__".to_string(),
            tokio::spawn(run_driver(inner, shutdown_rx)),
        );
        info!(interval = ?self.inner.config.check_interval, "health checker started");
    }

    /// Cancel in-flight probes and wait them out briefly.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        let mut tasks = self.inner.tasks.lock().await;
        for (key, handle) in tasks.drain() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                abort.abort();
                debug!(key, "probe task aborted after grace");
            }
        }
        info!("health checker stopped");
    }

    /// Probe one instance immediately, record the result, and return it.
    pub async fn check_instance_now(&self, template_id: &str, instance_id: &str) -> Option<bool> {
        let instance = self.inner.registry.instance(template_id, instance_id)?;
        let healthy = self.inner.probe(&instance).await;
        self.inner.record(template_id, instance_id, healthy);
        Some(healthy)
    }
}

async fn run_driver(inner: Arc<CheckerInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let reconcile_every = (inner.config.check_interval / 4).max(Duration::from_millis(50));
    loop {
        reconcile(&inner).await;
        tokio::select! {
            _ = tokio::time::sleep(reconcile_every) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Spawn probe loops for new instances, reap loops for gone ones.
async fn reconcile(inner: &Arc<CheckerInner>) {
    let snapshot = inner.registry.snapshot();
    let mut live_keys = Vec::new();
    for (template_id, routing) in &snapshot.templates {
        let interval = inner
            .config
            .check_interval
            .min(Duration::from_secs(routing.policy.check_interval));
        for instance in &routing.instances {
            live_keys.push((
                format!("{template_id}/{}", instance.id),
                template_id.clone(),
                instance.id.clone(),
                interval,
            ));
        }
    }

    let mut tasks = inner.tasks.lock().await;
    tasks.retain(|key, handle| {
        if key == "__driver__" {
            return true;
        }
        // A loop that died (panic or lost instance) gets respawned below.
        if handle.is_finished() {
            debug!(key, "probe loop finished, will respawn if still registered");
            return false;
        }
        let still_registered = live_keys.iter().any(|(k, ..)| k == key);
        if !still_registered {
            handle.abort();
            debug!(key, "probe loop reaped");
        }
        still_registered
    });

    for (key, template_id, instance_id, interval) in live_keys {
        if tasks.contains_key(&key) {
            continue;
        }
        let inner = Arc::clone(inner);
        let shutdown_rx = inner.shutdown.subscribe();
        tasks.insert(
            key,
            tokio::spawn(probe_loop(inner, template_id, instance_id, interval, shutdown_rx)),
        );
    }
}

async fn probe_loop(
    inner: Arc<CheckerInner>,
    template_id: String,
    instance_id: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // First probe lands somewhere inside the interval.
    let jitter = interval.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
    tokio::select! {
        _ = tokio::time::sleep(jitter) => {}
        _ = shutdown.changed() => return,
    }

    loop {
        let Some(instance) = inner.registry.instance(&template_id, &instance_id) else {
            return;
        };

        let healthy = {
            let _permit = inner
                .semaphore
                .acquire()
                .await
                .expect("probe semaphore never closes");
            inner.probe(&instance).await
        };
        inner.record(&template_id, &instance_id, healthy);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
    }
}

impl CheckerInner {
    fn record(&self, template_id: &str, instance_id: &str, healthy: bool) {
        self.balancer.record_probe(template_id, instance_id, healthy);
        if let Some((previous, current)) = self.registry.update_health(
            template_id,
            instance_id,
            healthy,
            self.config.max_consecutive_failures,
            self.config.min_consecutive_successes,
        ) {
            if previous != current {
                if current == InstanceStatus::Unhealthy {
                    warn!(template = template_id, instance = instance_id, "instance marked unhealthy");
                } else {
                    info!(template = template_id, instance = instance_id, "instance healthy");
                }
                let _ = self.events.send(HealthEvent {
                    template_id: template_id.to_string(),
                    instance_id: instance_id.to_string(),
                    previous,
                    current,
                });
            }
        }
    }

    /// One probe. HTTP: 2xx from the health path. stdio: a full
    /// initialize + tools/list round trip on a throwaway child.
    async fn probe(&self, instance: &Instance) -> bool {
        match instance.transport {
            Transport::Http => self.probe_http(instance).await,
            Transport::Stdio => self.probe_stdio(instance).await,
        }
    }

    async fn probe_http(&self, instance: &Instance) -> bool {
        let Some(endpoint) = &instance.endpoint else {
            return false;
        };
        let url = format!(
            "{}{}",
            endpoint.trim_end_matches('/'),
            self.config.health_path
        );
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(instance = %instance.id, url, error = %e, "http probe failed");
                false
            }
        }
    }

    async fn probe_stdio(&self, instance: &Instance) -> bool {
        let Some(command) = &instance.command else {
            return false;
        };
        let Some((program, args)) = command.split_first() else {
            return false;
        };
        let mut spawn = StdioSpawn::new(program.clone(), args.to_vec());
        if let Some(env) = &instance.env {
            spawn.env = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }

        let connection = match StdioConnection::spawn(&spawn, self.config.probe_timeout) {
            Ok(connection) => connection,
            Err(e) => {
                debug!(instance = %instance.id, error = %e, "stdio probe spawn failed");
                return false;
            }
        };
        let ok = async {
            connection.initialize().await?;
            connection.list_tools().await
        }
        .await
        .is_ok();
        connection.close().await;
        ok
    }
}
