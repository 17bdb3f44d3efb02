// ABOUTME: Arena orchestrator daemon: wires components, serves HTTP, tears down on SIGTERM
// ABOUTME: Docker-backed in production; all component seams are trait objects

use anyhow::Context;
use arena_api::AppState;
use arena_orchestrator::{
    Config, ContainerRuntime, DockerRuntime, EngineConfig, GatewayRegistry, HttpCodeGenerator,
    LifecycleEngine, PortAllocator, RunStore, UiCallback, WorkspaceManager,
};
use axum::http::{HeaderValue, Method};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,arena_orchestrator=info,arena_api=info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    info!("starting arena orchestrator on port {}", config.port);

    let runtime = Arc::new(
        DockerRuntime::new(
            config.isolation_network.clone(),
            config.runtime_image.clone(),
        )
        .context("failed to construct docker client")?,
    );
    match runtime.ping().await {
        Ok(()) => {
            if let Err(e) = runtime.ensure_network(&config.isolation_network).await {
                warn!("could not ensure isolation network: {}", e);
            }
            match runtime.reap_stale().await {
                Ok(0) => {}
                Ok(n) => info!("reaped {} stale containers from a previous daemon", n),
                Err(e) => warn!("stale container reaping failed: {}", e),
            }
        }
        Err(e) => {
            // Runs will fail cleanly until the engine comes back; the HTTP
            // surface stays up either way.
            error!("docker daemon unreachable: {}", e);
        }
    }

    let store = Arc::new(RunStore::new());
    let ports = Arc::new(PortAllocator::new(
        config.port_range_start,
        config.port_range_end,
    ));
    let workspaces = Arc::new(WorkspaceManager::new(
        config.workspace_base.clone(),
        config.template_dir.clone(),
    ));
    let gateway = Arc::new(GatewayRegistry::new());
    let generator = Arc::new(HttpCodeGenerator::new(
        config.codegen_gateway_url.clone(),
        config.codegen_gateway_api_key.clone(),
    ));
    let callback = Arc::new(UiCallback::new(config.main_app_url.clone()));

    let engine = Arc::new(LifecycleEngine::new(
        store.clone(),
        ports,
        workspaces,
        runtime,
        gateway.clone(),
        generator,
        Some(callback),
        EngineConfig {
            public_host: config.public_host.clone(),
            ..Default::default()
        },
    ));

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .cors_origin
                .parse::<HeaderValue>()
                .context("invalid CORS origin")?,
        )
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    let state = AppState {
        store,
        engine: engine.clone(),
        gateway,
        preview_domain: config.preview_domain.clone(),
    };
    let app = arena_api::create_router(state).layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, stopping all active containers");
    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
