//! mcpgridd — the gateway daemon.
//!
//! One process hosting the gateway router and the health checker over a
//! file-backed registry.
//!
//! # Usage
//!
//! ```text
//! mcpgridd serve --port 8080 --registry-file /var/lib/mcpgrid/registry.json
//! ```
//!
//! Environment: `GATEWAY_HOST`, `GATEWAY_PORT`, `GATEWAY_WORKERS`,
//! `GATEWAY_REGISTRY_FILE`, `MCP_LOG_LEVEL`, `MCP_SUBNET` (read by the
//! docker backend at network-creation time).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use mcpgrid_backend::Backend;
use mcpgrid_gateway::{
    build_router, AuthConfig, GatewayRegistry, GatewayState, HealthCheckerConfig,
};
use mcpgrid_template::TemplateRegistry;
use mcpgrid_tools::ToolManager;

#[derive(Parser)]
#[command(name = "mcpgridd", about = "mcpgrid gateway daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the gateway (router + health checker).
    Serve {
        /// Bind host; falls back to GATEWAY_HOST, then 0.0.0.0.
        #[arg(long)]
        host: Option<String>,

        /// Bind port; falls back to GATEWAY_PORT, then 8080.
        #[arg(long)]
        port: Option<u16>,

        /// Registry JSON path; falls back to GATEWAY_REGISTRY_FILE. When
        /// neither is given, routing state is in-memory only.
        #[arg(long)]
        registry_file: Option<PathBuf>,

        /// Template root for the stdio fallback tier.
        #[arg(long, default_value = "/var/lib/mcpgrid/templates")]
        templates_dir: PathBuf,

        /// Backend for ephemeral stdio spawns: docker, kubernetes, or mock.
        #[arg(long, default_value = "docker")]
        backend: String,

        /// Health probe interval in seconds.
        #[arg(long, default_value = "30")]
        check_interval: u64,

        /// Consecutive probe failures before an instance is unhealthy.
        #[arg(long, default_value = "3")]
        max_consecutive_failures: u32,

        /// Accepted bearer tokens (repeatable). With no tokens and no API
        /// keys, the gateway runs open.
        #[arg(long = "bearer-token")]
        bearer_tokens: Vec<String>,

        /// Accepted API keys for the X-API-Key header (repeatable).
        #[arg(long = "api-key")]
        api_keys: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let default_filter = std::env::var("MCP_LOG_LEVEL")
        .map(|level| format!("{level},mcpgrid=debug"))
        .unwrap_or_else(|_| "info,mcpgrid=debug,mcpgridd=debug".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.parse().expect("static filter parses")),
        )
        .init();

    let cli = Cli::parse();

    // GATEWAY_WORKERS sizes the runtime; absent means tokio's default.
    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Ok(workers) = std::env::var("GATEWAY_WORKERS") {
        runtime.worker_threads(workers.parse()?);
    }
    let runtime = runtime.build()?;

    match cli.command {
        Command::Serve {
            host,
            port,
            registry_file,
            templates_dir,
            backend,
            check_interval,
            max_consecutive_failures,
            bearer_tokens,
            api_keys,
        } => runtime.block_on(serve(
            host,
            port,
            registry_file,
            templates_dir,
            backend,
            check_interval,
            max_consecutive_failures,
            bearer_tokens,
            api_keys,
        )),
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    host: Option<String>,
    port: Option<u16>,
    registry_file: Option<PathBuf>,
    templates_dir: PathBuf,
    backend: String,
    check_interval: u64,
    max_consecutive_failures: u32,
    bearer_tokens: Vec<String>,
    api_keys: Vec<String>,
) -> anyhow::Result<()> {
    if std::env::var("GATEWAY_DATABASE_URL").is_ok() {
        anyhow::bail!(
            "GATEWAY_DATABASE_URL is set, but this build persists the registry to a JSON file; \
             unset it and use GATEWAY_REGISTRY_FILE instead"
        );
    }

    let host = host
        .or_else(|| std::env::var("GATEWAY_HOST").ok())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port
        .or_else(|| std::env::var("GATEWAY_PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(8080);
    let registry_file =
        registry_file.or_else(|| std::env::var("GATEWAY_REGISTRY_FILE").ok().map(PathBuf::from));

    // ── Routing state ──────────────────────────────────────────
    let registry = match &registry_file {
        Some(path) => {
            info!(path = %path.display(), "opening file-backed registry");
            Arc::new(GatewayRegistry::open(path)?)
        }
        None => {
            info!("no registry file configured, routing state is in-memory");
            Arc::new(GatewayRegistry::in_memory())
        }
    };

    // ── Templates + stdio fallback ─────────────────────────────
    let templates = Arc::new(TemplateRegistry::load(&templates_dir)?);
    info!(
        root = %templates_dir.display(),
        count = templates.list().len(),
        "template registry loaded"
    );
    let backend = Arc::new(Backend::by_name(&backend)?);
    let tools = ToolManager::new(templates, backend);

    // ── Gateway state ──────────────────────────────────────────
    let auth = AuthConfig {
        bearer_tokens,
        api_keys,
    };
    if auth.is_enabled() {
        info!("authentication enabled");
    } else {
        info!("authentication disabled (open mode)");
    }

    let checker_config = HealthCheckerConfig {
        check_interval: Duration::from_secs(check_interval),
        max_consecutive_failures,
        ..Default::default()
    };
    let state = GatewayState::with_checker_config(registry, auth, checker_config).with_tools(tools);

    let checker = state.checker.clone();
    checker.start().await;

    // ── HTTP server ────────────────────────────────────────────
    let router = build_router(state);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await?;

    checker.stop().await;
    info!("gateway stopped");
    Ok(())
}
