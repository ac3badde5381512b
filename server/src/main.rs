use clap::Parser;
use orchestrator::{OrchestratorSettings, SessionOrchestrator};
use server::{AppState, bootstrap, create_router};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "voice-relay", version, about = "Telephony to AI voice relay")]
struct Args {
    /// TOML or YAML configuration file
    #[arg(short, long, env = "VR_CONFIG_FILE")]
    config: Option<PathBuf>
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = config::load_config(args.config.as_deref())?;
    observability::init_tracing(&config.observability)?;
    info!("Starting voice relay");

    observability::install_metrics_exporter(&config.observability)?;

    let store = Arc::new(bootstrap::build_store(&config.storage).await?);
    let registry = Arc::new(bootstrap::build_registry(&config)?);
    info!(providers = registry.len(), "Provider registry ready");

    let orchestrator = Arc::new(SessionOrchestrator::new(
        registry,
        store,
        OrchestratorSettings::from_config(&config)
    ));

    match orchestrator.recover_active_calls().await {
        Ok(calls) => info!(count = calls.len(), "Active calls restored from durable store"),
        Err(e) => warn!(error = %e, "Active call recovery failed")
    }

    let app = create_router(AppState::new(Arc::clone(&orchestrator)));

    let addr: SocketAddr =
        format!("{}:{}", config.server.admin_host, config.server.admin_port).parse()?;
    info!("Admin surface listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let ended = orchestrator.shutdown().await;
    info!(sessions = ended.len(), "Voice relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
