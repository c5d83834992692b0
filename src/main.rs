//! boiler-proxy: transparent relay between a pellet-boiler controller and
//! its vendor Internet Gateway. Entry point only — loads config, wires up
//! logging, and hands off to the orchestrator.

use boiler_proxy::orchestrator::Orchestrator;
use boiler_proxy::shutdown::Shutdown;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "boiler-proxy starting");

    let config = match boiler_proxy::config::load_config() {
        Ok(cfg) => {
            info!(
                gateway_iface = %cfg.network.gateway_iface,
                boiler_iface = %cfg.network.boiler_iface,
                discovery_port = cfg.network.discovery_port,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown, handle) = Shutdown::new();
    let orchestrator = Orchestrator::new(config);
    let orchestrator_task = tokio::spawn(async move { orchestrator.run(handle).await });

    shutdown_signal().await;
    info!("shutdown signal received, stopping orchestrator");
    shutdown.request();

    if let Err(e) = orchestrator_task.await {
        eprintln!("orchestrator task panicked: {e}");
    }
    info!("boiler-proxy stopped");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
