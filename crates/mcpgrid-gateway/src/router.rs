//! The gateway HTTP surface.
//!
//! `/mcp/{template}/...` routes resolve the template, pick an instance
//! through the load balancer, and bridge the call to the chosen server
//! over its transport. Failures retry with exponential backoff against
//! other instances; non-idempotent calls (tool invocations) are retried
//! only when the failure happened before anything was transmitted. When a
//! template has no healthy registered instance, tool traffic can fall
//! back to a short-lived stdio spawn of the template image.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use mcpgrid_mcp::{ConnectionError, HttpConnection, StdioConnection};
use mcpgrid_template::Transport;
use mcpgrid_tools::{ephemeral_spawn, DiscoverOptions, ToolManager};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::{is_health_route, AuthConfig};
use crate::balancer::LoadBalancer;
use crate::error::{GatewayError, GatewayResult};
use crate::health::{HealthChecker, HealthCheckerConfig};
use crate::pool::{PoolError, StdioPool};
use crate::registry::{GatewayRegistry, Instance, Policy, TemplateRouting};

/// Retry backoff: base 100 ms, doubling, 50% jitter.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Everything the handlers share.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<GatewayRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub checker: HealthChecker,
    pub pool: Arc<StdioPool>,
    pub tools: Option<ToolManager>,
    pub auth: AuthConfig,
    pub http_client: reqwest::Client,
    stats: Arc<Stats>,
}

struct Stats {
    started_at: Instant,
    total_requests: AtomicU64,
}

impl GatewayState {
    pub fn new(registry: Arc<GatewayRegistry>, auth: AuthConfig) -> Self {
        Self::with_checker_config(registry, auth, HealthCheckerConfig::default())
    }

    pub fn with_checker_config(
        registry: Arc<GatewayRegistry>,
        auth: AuthConfig,
        checker_config: HealthCheckerConfig,
    ) -> Self {
        let balancer = Arc::new(LoadBalancer::new());
        let checker = HealthChecker::new(registry.clone(), balancer.clone(), checker_config);
        Self {
            registry,
            balancer,
            checker,
            pool: Arc::new(StdioPool::new()),
            tools: None,
            auth,
            http_client: reqwest::Client::new(),
            stats: Arc::new(Stats {
                started_at: Instant::now(),
                total_requests: AtomicU64::new(0),
            }),
        }
    }

    /// Enable the stdio fallback tier.
    pub fn with_tools(mut self, tools: ToolManager) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// Build the full route set.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/mcp/{template}/tools/list", get(tools_list))
        .route("/mcp/{template}/tools/call", post(tools_call))
        .route("/mcp/{template}/resources/list", get(resources_list))
        .route("/mcp/{template}/resources/read", post(resources_read))
        .route("/mcp/{template}/health", get(template_health))
        .route("/gateway/health", get(gateway_health))
        .route("/gateway/registry", get(gateway_registry))
        .route("/gateway/stats", get(gateway_stats))
        .route("/gateway/register", post(register_instance))
        .route(
            "/gateway/deregister/{template}/{instance_id}",
            delete(deregister_instance),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if is_health_route(path) || state.auth.authorize(request.headers()) {
        next.run(request).await
    } else {
        warn!(path, "request rejected: missing or invalid credentials");
        GatewayError::AuthFailed.into_response()
    }
}

// ── MCP routes ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum McpMethod {
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourcesRead,
}

impl McpMethod {
    /// Whether the call may be replayed after partial transmission. Tool
    /// calls may have side effects; everything else is a read.
    fn is_idempotent(self) -> bool {
        !matches!(self, Self::ToolsCall)
    }
}

async fn tools_list(
    State(state): State<GatewayState>,
    Path(template): Path<String>,
) -> Response {
    mcp_request(state, template, McpMethod::ToolsList, Value::Null).await
}

async fn tools_call(
    State(state): State<GatewayState>,
    Path(template): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if body.get("name").and_then(Value::as_str).unwrap_or("").is_empty() {
        return GatewayError::BadRequest("missing tool name".into()).into_response();
    }
    mcp_request(state, template, McpMethod::ToolsCall, body).await
}

async fn resources_list(
    State(state): State<GatewayState>,
    Path(template): Path<String>,
) -> Response {
    mcp_request(state, template, McpMethod::ResourcesList, Value::Null).await
}

async fn resources_read(
    State(state): State<GatewayState>,
    Path(template): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if body.get("uri").and_then(Value::as_str).unwrap_or("").is_empty() {
        return GatewayError::BadRequest("missing resource uri".into()).into_response();
    }
    mcp_request(state, template, McpMethod::ResourcesRead, body).await
}

async fn mcp_request(
    state: GatewayState,
    template_id: String,
    method: McpMethod,
    params: Value,
) -> Response {
    state.stats.total_requests.fetch_add(1, Ordering::Relaxed);

    let routing = state.registry.routing(&template_id);
    let has_healthy = routing
        .as_ref()
        .is_some_and(|r| r.instances.iter().any(Instance::is_healthy));

    if !has_healthy {
        return fallback_response(&state, &template_id, method, &params, routing.is_some()).await;
    }
    let routing = routing.expect("has_healthy implies routing");

    match forward(&state, &template_id, &routing, method, &params).await {
        Ok(outcome) => {
            let mut response = Json(outcome.value).into_response();
            set_header(&mut response, "x-instance-id", &outcome.instance_id);
            set_header(
                &mut response,
                "x-strategy",
                &routing.policy.strategy.to_string(),
            );
            set_header(&mut response, "x-attempts", &outcome.attempts.to_string());
            response
        }
        Err(failure) => {
            let mut response = failure.error.into_response();
            set_header(&mut response, "x-attempts", &failure.attempts.to_string());
            if let Some(instance_id) = &failure.last_instance {
                set_header(&mut response, "x-instance-id", instance_id);
            }
            response
        }
    }
}

struct ForwardOutcome {
    value: Value,
    instance_id: String,
    attempts: u32,
}

struct ForwardFailure {
    error: GatewayError,
    attempts: u32,
    last_instance: Option<String>,
}

async fn forward(
    state: &GatewayState,
    template_id: &str,
    routing: &TemplateRouting,
    method: McpMethod,
    params: &Value,
) -> Result<ForwardOutcome, ForwardFailure> {
    let policy = &routing.policy;
    let wall_clock = Duration::from_secs(policy.timeout);
    let started = Instant::now();

    let mut excluded: HashSet<String> = HashSet::new();
    let mut attempts = 0u32;
    let mut last_instance: Option<String> = None;

    loop {
        attempts += 1;
        let instance = match state.balancer.select(
            template_id,
            policy.strategy,
            &routing.instances,
            &excluded,
        ) {
            Ok(instance) => instance,
            Err(error) => {
                return Err(ForwardFailure {
                    error,
                    attempts: attempts - 1,
                    last_instance,
                })
            }
        };
        last_instance = Some(instance.id.clone());

        let Some(remaining) = wall_clock.checked_sub(started.elapsed()) else {
            return Err(ForwardFailure {
                error: GatewayError::Timeout {
                    instance_id: instance.id,
                },
                attempts,
                last_instance,
            });
        };

        state.balancer.record_request_start(template_id, &instance.id);
        let outcome =
            tokio::time::timeout(remaining, dispatch(state, &instance, policy, method, params))
                .await;
        state.balancer.record_request_end(template_id, &instance.id);

        let error = match outcome {
            // Wall clock expired mid-flight.
            Err(_) => {
                return Err(ForwardFailure {
                    error: GatewayError::Timeout {
                        instance_id: instance.id,
                    },
                    attempts,
                    last_instance,
                })
            }
            Ok(Ok(value)) => {
                return Ok(ForwardOutcome {
                    value,
                    instance_id: instance.id,
                    attempts,
                })
            }
            Ok(Err(error)) => error,
        };

        let retryable = is_retryable(&error, method);
        debug!(
            template = template_id,
            instance = %instance.id,
            attempt = attempts,
            retryable,
            "forward attempt failed"
        );
        if !retryable || attempts > policy.max_retries {
            return Err(ForwardFailure {
                error: map_dispatch_error(error),
                attempts,
                last_instance,
            });
        }

        // The failed instance stays out for the rest of this request.
        excluded.insert(instance.id);

        let backoff = BACKOFF_BASE * 2u32.saturating_pow(attempts - 1);
        let jittered = backoff.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        tokio::time::sleep(jittered).await;
    }
}

enum DispatchError {
    Conn(ConnectionError),
    QueueFull(String),
}

fn is_retryable(error: &DispatchError, method: McpMethod) -> bool {
    match error {
        // Nothing was transmitted yet: always safe to try elsewhere.
        DispatchError::Conn(ConnectionError::Connect(_)) => true,
        DispatchError::QueueFull(_) => true,
        // Structured results and unknown names don't improve on retry.
        DispatchError::Conn(ConnectionError::ToolExecution { .. }) => false,
        DispatchError::Conn(ConnectionError::NotFound(_)) => false,
        // Mid-flight transport failures: only for idempotent calls.
        DispatchError::Conn(_) => method.is_idempotent(),
    }
}

fn map_dispatch_error(error: DispatchError) -> GatewayError {
    match error {
        DispatchError::QueueFull(instance_id) => GatewayError::QueueFull(instance_id),
        DispatchError::Conn(ConnectionError::ToolExecution { message, result }) => {
            GatewayError::Upstream {
                message,
                details: serde_json::to_value(result).ok(),
            }
        }
        DispatchError::Conn(ConnectionError::NotFound(what)) => GatewayError::NotFound(what),
        DispatchError::Conn(error) => GatewayError::Upstream {
            message: error.to_string(),
            details: None,
        },
    }
}

/// One attempt against one instance.
async fn dispatch(
    state: &GatewayState,
    instance: &Instance,
    policy: &Policy,
    method: McpMethod,
    params: &Value,
) -> Result<Value, DispatchError> {
    match instance.transport {
        Transport::Http => {
            let endpoint = instance
                .endpoint
                .as_deref()
                .ok_or_else(|| {
                    DispatchError::Conn(ConnectionError::Connect(
                        "http instance has no endpoint".into(),
                    ))
                })?
                .trim_end_matches('/');
            let connection = HttpConnection::with_client(
                state.http_client.clone(),
                format!("{endpoint}/mcp"),
                Duration::from_secs(policy.timeout),
            );
            call_over(&AnyConnection::Http(&connection), method, params).await
        }
        Transport::Stdio => {
            let borrowed = state
                .pool
                .acquire(instance, policy.pool_size, Duration::from_secs(policy.timeout))
                .await
                .map_err(|e| match e {
                    PoolError::QueueFull => DispatchError::QueueFull(instance.id.clone()),
                    PoolError::NoCommand => DispatchError::Conn(ConnectionError::Connect(
                        "stdio instance has no command".into(),
                    )),
                    PoolError::Spawn(e) => DispatchError::Conn(e),
                })?;

            let result = call_over(&AnyConnection::Stdio(borrowed.connection()), method, params).await;
            let reusable = !matches!(
                result,
                Err(DispatchError::Conn(
                    ConnectionError::Closed | ConnectionError::Timeout(_)
                ))
            );
            borrowed.release(reusable).await;
            result
        }
    }
}

/// Borrowed view over either transport for one attempt.
enum AnyConnection<'a> {
    Http(&'a HttpConnection),
    Stdio(&'a StdioConnection),
}

async fn call_over(
    connection: &AnyConnection<'_>,
    method: McpMethod,
    params: &Value,
) -> Result<Value, DispatchError> {
    let result = match method {
        McpMethod::ToolsList => {
            let tools = match connection {
                AnyConnection::Http(c) => c.list_tools().await,
                AnyConnection::Stdio(c) => c.list_tools().await,
            }
            .map_err(DispatchError::Conn)?;
            json!({ "tools": tools })
        }
        McpMethod::ToolsCall => {
            let name = params["name"].as_str().unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            let result = match connection {
                AnyConnection::Http(c) => c.call_tool(name, arguments).await,
                AnyConnection::Stdio(c) => c.call_tool(name, arguments).await,
            }
            .map_err(DispatchError::Conn)?;
            serde_json::to_value(result).unwrap_or(Value::Null)
        }
        McpMethod::ResourcesList => {
            let resources = match connection {
                AnyConnection::Http(c) => c.list_resources().await,
                AnyConnection::Stdio(c) => c.list_resources().await,
            }
            .map_err(DispatchError::Conn)?;
            serde_json::to_value(resources).unwrap_or(Value::Null)
        }
        McpMethod::ResourcesRead => {
            let uri = params["uri"].as_str().unwrap_or_default();
            let result = match connection {
                AnyConnection::Http(c) => c.read_resource(uri).await,
                AnyConnection::Stdio(c) => c.read_resource(uri).await,
            }
            .map_err(DispatchError::Conn)?;
            serde_json::to_value(result).unwrap_or(Value::Null)
        }
    };
    Ok(result)
}

/// No healthy registered instance: try the ephemeral stdio tier for tool
/// traffic, otherwise report what the registry knows.
async fn fallback_response(
    state: &GatewayState,
    template_id: &str,
    method: McpMethod,
    params: &Value,
    registered: bool,
) -> Response {
    let Some(tools) = &state.tools else {
        let error = if registered {
            GatewayError::NoHealthyInstances(template_id.to_string())
        } else {
            GatewayError::TemplateNotFound(template_id.to_string())
        };
        return error.into_response();
    };

    let template = match tools.registry().get(template_id) {
        Ok(template) => template,
        Err(_) if registered => {
            return GatewayError::NoHealthyInstances(template_id.to_string()).into_response()
        }
        Err(_) => return GatewayError::TemplateNotFound(template_id.to_string()).into_response(),
    };

    match method {
        McpMethod::ToolsList => {
            let discovered = tools.discover(template_id, DiscoverOptions::default()).await;
            let mut body = json!({ "tools": discovered.tools });
            body["_gateway_info"] = json!({
                "used_stdio_fallback": true,
                "discovery_method": discovered.method,
            });
            Json(body).into_response()
        }
        McpMethod::ToolsCall => {
            if !template.transport.supports(Transport::Stdio) {
                return GatewayError::BadRequest(format!(
                    "template '{template_id}' has no healthy instances and does not support stdio"
                ))
                .into_response();
            }
            let Some(spawn) = ephemeral_spawn(tools.backend().kind(), &template) else {
                return GatewayError::NoHealthyInstances(template_id.to_string()).into_response();
            };

            let connection =
                match StdioConnection::spawn(&spawn, Duration::from_secs(30)) {
                    Ok(connection) => connection,
                    Err(e) => {
                        return GatewayError::Upstream {
                            message: format!("stdio fallback failed: {e}"),
                            details: None,
                        }
                        .into_response()
                    }
                };
            let name = params["name"].as_str().unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            let result = async {
                connection.initialize().await?;
                connection.call_tool(name, arguments).await
            }
            .await;
            connection.close().await;

            match result {
                Ok(result) => {
                    let mut body = serde_json::to_value(result).unwrap_or(Value::Null);
                    body["_gateway_info"] = json!({"used_stdio_fallback": true});
                    Json(body).into_response()
                }
                Err(e) => map_dispatch_error(DispatchError::Conn(e)).into_response(),
            }
        }
        _ => GatewayError::NoHealthyInstances(template_id.to_string()).into_response(),
    }
}

// ── Gateway management routes ──────────────────────────────────

async fn template_health(
    State(state): State<GatewayState>,
    Path(template): Path<String>,
) -> GatewayResult<Json<Value>> {
    let routing = state
        .registry
        .routing(&template)
        .ok_or_else(|| GatewayError::TemplateNotFound(template.clone()))?;

    let mut instances = serde_json::Map::new();
    let mut healthy = 0usize;
    for instance in &routing.instances {
        let ok = state
            .checker
            .check_instance_now(&template, &instance.id)
            .await
            .unwrap_or(false);
        if ok {
            healthy += 1;
        }
        // Re-read for post-probe counters.
        let current = state.registry.instance(&template, &instance.id);
        instances.insert(
            instance.id.clone(),
            json!({
                "healthy": ok,
                "transport": instance.transport,
                "endpoint": instance.endpoint,
                "status": current.as_ref().map(|i| i.status),
                "consecutive_failures": current.as_ref().map(|i| i.consecutive_failures),
                "last_check": current.as_ref().and_then(|i| i.last_check),
            }),
        );
    }

    let total = routing.instances.len();
    Ok(Json(json!({
        "template_id": template,
        "total_instances": total,
        "healthy_instances": healthy,
        "health_percentage": if total > 0 { healthy as f64 / total as f64 * 100.0 } else { 0.0 },
        "instances": instances,
    })))
}

async fn gateway_health(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.stats.started_at.elapsed().as_secs(),
        "total_requests": state.stats.total_requests.load(Ordering::Relaxed),
        "registry": state.registry.stats(),
        "load_balancer": state.balancer.stats(),
    }))
}

async fn gateway_registry(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "templates": state.registry.snapshot().templates,
        "stats": state.registry.stats(),
    }))
}

async fn gateway_stats(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "gateway": {
            "uptime_seconds": state.stats.started_at.elapsed().as_secs(),
            "total_requests": state.stats.total_requests.load(Ordering::Relaxed),
        },
        "registry": state.registry.stats(),
        "load_balancer": state.balancer.stats(),
    }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(alias = "template_name")]
    template_id: String,
    instance: Instance,
    #[serde(default)]
    policy: Option<Policy>,
}

async fn register_instance(
    State(state): State<GatewayState>,
    Json(request): Json<RegisterRequest>,
) -> GatewayResult<Json<Value>> {
    if request.instance.id.is_empty() {
        return Err(GatewayError::BadRequest("instance id must not be empty".into()));
    }
    let instance_id = request.instance.id.clone();
    state
        .registry
        .register(&request.template_id, request.instance, request.policy)?;
    Ok(Json(json!({
        "message": format!(
            "registered instance {instance_id} for template {}",
            request.template_id
        ),
        "template_id": request.template_id,
        "instance_id": instance_id,
    })))
}

async fn deregister_instance(
    State(state): State<GatewayState>,
    Path((template, instance_id)): Path<(String, String)>,
) -> GatewayResult<Json<Value>> {
    if !state.registry.deregister(&template, &instance_id)? {
        return Err(GatewayError::InstanceNotFound(instance_id));
    }
    state.balancer.forget_instance(&template, &instance_id);
    state.pool.evict(&instance_id).await;
    Ok(Json(json!({
        "message": format!("deregistered instance {instance_id} from template {template}"),
    })))
}

fn set_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}
