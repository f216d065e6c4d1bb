// lmgate - LAN gateway for a local LM Studio-style model runtime
//
// The gateway exposes an OpenAI-compatible HTTP surface to LAN clients and
// adds what the backend itself does not have:
// - Access filter (axum middleware): CIDR allowlist + shared-secret header
// - Proxy (axum + reqwest): forwards /v1/* calls, injecting the active model
// - Control client (WebSocket): model list/load/unload on the backend
// - Log tailer (notify + polling): turns backend log files into events
// - Event bus: fans everything out to /debug/stream SSE subscribers

mod access;
mod admin;
mod bus;
mod cli;
mod config;
mod control;
mod debug;
mod events;
mod logging;
mod metrics;
mod proxy;
mod startup;
mod state;
mod tailer;

use std::sync::Arc;

use anyhow::Result;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI subcommands first (config --show, --reset, --path)
    let Some(cli) = cli::handle_cli() else {
        return Ok(());
    };

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists();

    let mut config = Config::from_env();

    // CLI flags beat env and file
    if let Some(backend) = cli.backend {
        // Re-derive the control URL unless it was configured explicitly
        if config.control_url == config::derive_control_url(&config.backend_url) {
            config.control_url = config::derive_control_url(&backend);
        }
        config.backend_url = backend;
    }
    if let Some(host) = cli.host {
        config.bind_host = host;
    }
    if let Some(port) = cli.port {
        config.bind_port = port;
    }

    logging::init(&config.log_level);
    startup::print_startup(&config);

    // Invalid allowlist entries are fatal: a typo must not widen access
    let filter = Arc::new(access::AccessFilter::from_config(&config)?);

    let bus = bus::EventBus::new();
    let app = state::AppState::shared();
    let control = Arc::new(control::ControlClient::new(config.control_url.clone()));
    let gateway = proxy::GatewayState::new(&config, bus.clone(), app, control)?;

    // The tailer runs autonomously; it only talks to the bus
    let tailer_handle = if config.enable_log_monitoring {
        let tailer = tailer::LogTailer::new(config.log_dir.clone(), bus.clone());
        Some(tokio::spawn(tailer.run()))
    } else {
        tracing::debug!("log monitoring disabled");
        None
    };

    proxy::serve(&config, gateway, filter, shutdown_signal()).await?;

    if let Some(handle) = tailer_handle {
        handle.abort();
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
