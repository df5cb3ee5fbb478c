//! The four-tier discovery cascade.
//!
//! Order: cache hit, live HTTP probe of a running deployment, an ephemeral
//! stdio spawn of the template image, and the template's static tool list.
//! Every tier that fails is logged and skipped; a cascade with no surviving
//! tier yields `{tools: [], method: none}` rather than an error.

use std::sync::Arc;
use std::time::Duration;

use mcpgrid_backend::{Backend, BackendKind, DeploymentStatus};
use mcpgrid_mcp::{HttpConnection, StdioConnection, StdioSpawn, Tool};
use mcpgrid_template::{TemplateDescriptor, TemplateRegistry, Transport};
use tracing::{debug, info, warn};

use crate::cache::{DiscoveryMethod, DiscoveryResult, LoadResult, Loader, ToolCache};

/// Default probe timeouts per tier.
pub const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const STDIO_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    /// Skip the cache and force a live cascade.
    pub refresh: bool,
    pub http_timeout: Duration,
    pub stdio_timeout: Duration,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            refresh: false,
            http_timeout: HTTP_PROBE_TIMEOUT,
            stdio_timeout: STDIO_PROBE_TIMEOUT,
        }
    }
}

struct Inner {
    registry: Arc<TemplateRegistry>,
    backend: Arc<Backend>,
    cache: Arc<ToolCache>,
}

/// Answers tool enumeration for templates. Cheap to clone.
#[derive(Clone)]
pub struct ToolManager {
    inner: Arc<Inner>,
}

impl ToolManager {
    pub fn new(registry: Arc<TemplateRegistry>, backend: Arc<Backend>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                backend,
                cache: Arc::new(ToolCache::new()),
            }),
        }
    }

    pub fn with_cache(mut self, cache: ToolCache) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("with_cache before sharing");
        inner.cache = Arc::new(cache);
        self
    }

    /// Enumerate a template's tools through the cascade.
    pub async fn discover(&self, template_id: &str, options: DiscoverOptions) -> DiscoveryResult {
        let generation = self.inner.registry.generation();
        let loader = self.loader(template_id, options.clone());
        self.inner
            .cache
            .get_or_load(template_id, generation, options.refresh, loader)
            .await
    }

    /// Drop the cache entry for a template.
    pub fn invalidate(&self, template_id: &str) {
        self.inner.cache.invalidate(template_id);
    }

    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.inner.registry
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.inner.backend
    }

    fn loader(&self, template_id: &str, options: DiscoverOptions) -> Loader {
        let inner = self.inner.clone();
        let template_id = template_id.to_string();
        Arc::new(move || {
            let inner = inner.clone();
            let template_id = template_id.clone();
            let options = options.clone();
            Box::pin(async move { run_cascade(&inner, &template_id, &options).await })
        })
    }
}

async fn run_cascade(inner: &Inner, template_id: &str, options: &DiscoverOptions) -> LoadResult {
    let template = match inner.registry.get(template_id) {
        Ok(template) => template,
        Err(e) => {
            warn!(template = template_id, error = %e, "discovery: template unresolvable");
            return LoadResult::none();
        }
    };

    // Tier 2: live HTTP probe of a running deployment.
    if template.transport.supports(Transport::Http) {
        match probe_http(inner, &template, options.http_timeout).await {
            Ok(Some(tools)) => {
                info!(template = template_id, count = tools.len(), "tools discovered over http");
                return LoadResult {
                    tools,
                    method: DiscoveryMethod::Http,
                };
            }
            Ok(None) => debug!(template = template_id, "no running http deployment to probe"),
            Err(reason) => warn!(template = template_id, %reason, "http probe failed"),
        }
    }

    // Tier 3: ephemeral stdio spawn.
    if template.transport.supports(Transport::Stdio) {
        match probe_stdio(inner, &template, options.stdio_timeout).await {
            Ok(Some(tools)) => {
                info!(template = template_id, count = tools.len(), "tools discovered over stdio");
                return LoadResult {
                    tools,
                    method: DiscoveryMethod::Stdio,
                };
            }
            Ok(None) => debug!(template = template_id, "stdio probe unsupported on this backend"),
            Err(reason) => warn!(template = template_id, %reason, "stdio probe failed"),
        }
    }

    // Tier 4: whatever the descriptor declares (possibly nothing).
    let tools: Vec<Tool> = template
        .tools
        .iter()
        .map(|t| Tool {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: t.input_schema.clone(),
        })
        .collect();
    debug!(template = template_id, count = tools.len(), "using static tool list");
    LoadResult {
        tools,
        method: DiscoveryMethod::Static,
    }
}

/// Probe the first running HTTP deployment of the template, if any.
async fn probe_http(
    inner: &Inner,
    template: &TemplateDescriptor,
    timeout: Duration,
) -> Result<Option<Vec<Tool>>, String> {
    let deployments = inner
        .backend
        .list(Some(&template.id))
        .await
        .map_err(|e| e.to_string())?;

    let Some(endpoint) = deployments
        .iter()
        .filter(|d| d.status == DeploymentStatus::Running)
        .find_map(|d| d.http_endpoint())
    else {
        return Ok(None);
    };

    let endpoint = format!("{endpoint}/mcp");
    let connection = HttpConnection::new(&endpoint, timeout).map_err(|e| e.to_string())?;
    let tools = connection.list_tools().await.map_err(|e| e.to_string())?;
    Ok(Some(tools))
}

/// The one-shot exec spec for a template on a given backend: run the image
/// with `--rm` semantics, stdio wired to the caller. The mock backend has
/// no processes to offer.
pub fn ephemeral_spawn(kind: BackendKind, template: &TemplateDescriptor) -> Option<StdioSpawn> {
    match kind {
        BackendKind::Docker => Some(StdioSpawn::new(
            "docker",
            vec![
                "run".into(),
                "-i".into(),
                "--rm".into(),
                template.image.clone(),
            ],
        )),
        BackendKind::Kubernetes => Some(StdioSpawn::new(
            "kubectl",
            vec![
                "run".into(),
                format!("{}-probe", template.id),
                "--rm".into(),
                "-i".into(),
                "--restart=Never".into(),
                format!("--image={}", template.image),
            ],
        )),
        BackendKind::Mock => None,
    }
}

/// Spawn the template image with `--rm` semantics, speak MCP on its pipes,
/// and tear it down.
async fn probe_stdio(
    inner: &Inner,
    template: &TemplateDescriptor,
    timeout: Duration,
) -> Result<Option<Vec<Tool>>, String> {
    let Some(spawn) = ephemeral_spawn(inner.backend.kind(), template) else {
        return Ok(None);
    };

    let connection = StdioConnection::spawn(&spawn, timeout).map_err(|e| e.to_string())?;
    let result = async {
        connection.initialize().await.map_err(|e| e.to_string())?;
        connection.list_tools().await.map_err(|e| e.to_string())
    }
    .await;
    connection.close().await;
    result.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use mcpgrid_backend::DeployRequest;
    use serde_json::json;

    fn registry_with(
        id: &str,
        body: serde_json::Value,
    ) -> (Arc<TemplateRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let template_dir = dir.path().join(id);
        std::fs::create_dir_all(&template_dir).unwrap();
        std::fs::write(
            template_dir.join("template.json"),
            serde_json::to_string(&body).unwrap(),
        )
        .unwrap();
        (Arc::new(TemplateRegistry::load(dir.path()).unwrap()), dir)
    }

    fn demo_with_static_tools() -> serde_json::Value {
        json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "image": "example/demo:latest",
            "transport": {"default": "http", "supported": ["http", "stdio"]},
            "tools": [{"name": "say_hello", "description": "Greets", "inputSchema": {}}],
        })
    }

    #[tokio::test]
    async fn falls_back_to_static_tools_without_deployments() {
        let (registry, _dir) = registry_with("demo", demo_with_static_tools());
        let backend = Arc::new(Backend::by_name("mock").unwrap());
        let manager = ToolManager::new(registry, backend);

        let result = manager.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(result.method, DiscoveryMethod::Static);
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools[0].name, "say_hello");
    }

    #[tokio::test]
    async fn second_call_within_ttl_hits_cache() {
        let (registry, _dir) = registry_with("demo", demo_with_static_tools());
        let backend = Arc::new(Backend::by_name("mock").unwrap());
        let manager = ToolManager::new(registry, backend);

        let first = manager.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(first.method, DiscoveryMethod::Static);

        let second = manager.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(second.method, DiscoveryMethod::Cache);
        assert_eq!(second.tools, first.tools);
    }

    #[tokio::test]
    async fn unknown_template_yields_empty_with_method_none() {
        let (registry, _dir) = registry_with("demo", demo_with_static_tools());
        let backend = Arc::new(Backend::by_name("mock").unwrap());
        let manager = ToolManager::new(registry, backend);

        let result = manager.discover("ghost", DiscoverOptions::default()).await;
        assert_eq!(result.method, DiscoveryMethod::None);
        assert!(result.tools.is_empty());
    }

    #[tokio::test]
    async fn live_http_deployment_wins_over_static() {
        // A real MCP endpoint exposing two tools.
        let app = Router::new().route(
            "/mcp",
            post(|Json(req): Json<serde_json::Value>| async move {
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "result": {"tools": [
                        {"name": "say_hello", "description": "", "inputSchema": {}},
                        {"name": "echo", "description": "", "inputSchema": {}},
                    ]}
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (registry, _dir) = registry_with("demo", demo_with_static_tools());
        let backend = Arc::new(Backend::by_name("mock").unwrap());
        backend
            .deploy(DeployRequest {
                template_id: "demo".into(),
                image: "example/demo:latest".into(),
                port: Some(port),
                ..Default::default()
            })
            .await
            .unwrap();

        let manager = ToolManager::new(registry, backend);

        let result = manager
            .discover("demo", DiscoverOptions { refresh: true, ..Default::default() })
            .await;
        assert_eq!(result.method, DiscoveryMethod::Http);
        assert_eq!(result.tools.len(), 2);

        // Within TTL the same answer comes from the cache.
        let cached = manager.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(cached.method, DiscoveryMethod::Cache);
        assert_eq!(cached.tools.len(), 2);
    }

    #[tokio::test]
    async fn cascade_upgrade_static_then_http_after_deploy() {
        let app = Router::new().route(
            "/mcp",
            post(|Json(req): Json<serde_json::Value>| async move {
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "result": {"tools": [
                        {"name": "say_hello", "description": "", "inputSchema": {}},
                        {"name": "echo", "description": "", "inputSchema": {}},
                    ]}
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (registry, _dir) = registry_with("demo", demo_with_static_tools());
        let backend = Arc::new(Backend::by_name("mock").unwrap());
        let manager = ToolManager::new(registry.clone(), backend.clone());

        // No deployment yet: static tier.
        let before = manager.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(before.method, DiscoveryMethod::Static);
        assert_eq!(before.tools.len(), 1);

        // Start an HTTP deployment, then force a refresh.
        backend
            .deploy(DeployRequest {
                template_id: "demo".into(),
                image: "example/demo:latest".into(),
                port: Some(port),
                ..Default::default()
            })
            .await
            .unwrap();

        let after = manager
            .discover("demo", DiscoverOptions { refresh: true, ..Default::default() })
            .await;
        assert_eq!(after.method, DiscoveryMethod::Http);
        assert_eq!(after.tools.len(), 2);

        let cached = manager.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(cached.method, DiscoveryMethod::Cache);
        assert_eq!(cached.tools.len(), 2);
    }

    #[tokio::test]
    async fn registry_refresh_invalidates_cached_tools() {
        let (registry, dir) = registry_with("demo", demo_with_static_tools());
        let backend = Arc::new(Backend::by_name("mock").unwrap());
        let manager = ToolManager::new(registry.clone(), backend);

        manager.discover("demo", DiscoverOptions::default()).await;

        // Change the template on disk and refresh the registry.
        let mut body = demo_with_static_tools();
        body["tools"] = json!([
            {"name": "say_hello", "description": "", "inputSchema": {}},
            {"name": "wave", "description": "", "inputSchema": {}},
        ]);
        std::fs::write(
            dir.path().join("demo/template.json"),
            serde_json::to_string(&body).unwrap(),
        )
        .unwrap();
        registry.refresh().unwrap();

        let result = manager.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(result.method, DiscoveryMethod::Static, "generation bump bypasses cache");
        assert_eq!(result.tools.len(), 2);
    }
}
