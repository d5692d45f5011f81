mod adapters;
mod api;
mod config;
mod core;
mod telemetry;

use std::sync::Arc;
use tracing::{info, warn};

use crate::adapters::agent::HttpAgent;
use crate::adapters::registry::Registry;
use crate::config::AppConfig;
use crate::core::dispatch::LoadQueue;
use crate::core::fleet::FleetService;
use crate::core::orchestrator::Orchestrator;

pub struct AppState {
    pub fleet: FleetService,
    pub api_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::load();
    telemetry::init(&cfg)?;

    info!(
        event = "SYSTEM_STARTUP",
        service.version = env!("CARGO_PKG_VERSION"),
        node.name = %cfg.node_name,
        env = %cfg.env,
        "Model fleet manager booting"
    );

    let registry = Arc::new(match &cfg.registry_path {
        Some(path) => Registry::open(path).await?,
        None => {
            warn!(event = "REGISTRY_IN_MEMORY", "REGISTRY_PATH not set, state is lost on restart");
            Registry::in_memory()
        }
    });
    let agent: Arc<dyn adapters::agent::InferenceAgent> = Arc::new(HttpAgent::new(cfg.remote_timeout)?);
    let queue = Arc::new(LoadQueue::start(cfg.load_workers));

    let orchestrator = Orchestrator::new(registry.clone(), agent.clone(), queue.clone());
    let fleet = FleetService::new(registry, agent, orchestrator, cfg.finetuned_models.clone());
    let state = Arc::new(AppState { fleet, api_token: cfg.api_token.clone() });

    let app = api::routes::create_router(state);
    let addr = format!("{}:{}", cfg.host, cfg.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(event = "HTTP_LISTENING", addr = %addr, load.workers = queue.capacity(), "API ready");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!(event = "SYSTEM_SHUTDOWN", "Draining pending loads");
    queue.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(event = "SIGNAL_HANDLER_FAILED", error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => { sig.recv().await; }
            Err(e) => {
                warn!(event = "SIGNAL_HANDLER_FAILED", error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
