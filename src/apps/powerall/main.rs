//! powerall main entry point
//! powerall 主入口点

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use powerall::agent::config::{AgentConfig, CliArgs};
use powerall::agent::http_gateway::HttpGateway;
use powerall::components::ComponentRegistry;
use powerall::config::init_tracing;

fn main() -> Result<()> {
    let args = CliArgs::parse();
    let log_args = format!("{:?}", args);

    let config = AgentConfig::load_with_cli(&args)?;
    init_tracing(&config.logging_config())?;
    tracing::info!("Starting powerall with args: {}", log_args);

    // Blocking backend clients must live outside the async runtime.
    let mut registry = ComponentRegistry::standard();
    registry.setup_all(&config);
    let registry = Arc::new(registry);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.max_blocking_threads.max(1))
        .build()?;

    let result = runtime.block_on(run(Arc::new(config), registry.clone()));
    drop(runtime);

    registry.teardown_all();
    tracing::info!("powerall shutdown complete");
    result
}

async fn run(config: Arc<AgentConfig>, registry: Arc<ComponentRegistry>) -> Result<()> {
    tracing::info!("powerall starting with:");
    tracing::info!("  - HTTP gateway on: {}", config.http.bind_target());
    tracing::info!("  - Cluster: {}", config.cluster);
    tracing::info!("  - Components: {:?}", registry.names());

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let gateway = HttpGateway::new(config, registry);
    let mut server = tokio::spawn(gateway.start_with_shutdown(async move {
        let _ = shutdown_rx.await;
    }));

    tokio::select! {
        // The gateway only returns early when it could not start.
        res = &mut server => {
            return res.context("HTTP gateway task failed")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("powerall shutting down");
        }
    }

    let _ = shutdown_tx.send(());
    server.await.context("HTTP gateway task failed")??;
    Ok(())
}
