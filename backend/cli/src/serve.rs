//! `pagecast serve`: wires the coordinator to Chromium, ffmpeg and the HTTP
//! control surface, then runs until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pagecast_browser::ChromiumLauncher;
use pagecast_config::defaults::AUTO_START_DELAY_SECS;
use pagecast_config::{redacted_summary, validate, StreamerConfig};
use pagecast_gateway::{start_server, GatewayState};
use pagecast_pipeline::Coordinator;
use pagecast_supervisor::ProcessSpawner;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub async fn run_server(config: StreamerConfig) -> Result<()> {
    info!(config = %redacted_summary(&config), "Starting pagecast");
    let report = validate(&config);
    report.log();
    if !report.is_valid() {
        bail!(
            "configuration has {} error(s); run `pagecast check-config` for details",
            report.errors.len()
        );
    }

    let coordinator = Coordinator::new(
        config.pipeline_settings(),
        Arc::new(ChromiumLauncher::new(config.browser_settings())),
        Arc::new(ProcessSpawner),
    );

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.bind_address, config.port))?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let state = GatewayState::new(coordinator.clone(), &config.access_keyword);
    let mut server = tokio::spawn(start_server(addr, state, async move {
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
    }));

    if config.auto_start {
        info!("Auto-start enabled, starting stream in {} seconds", AUTO_START_DELAY_SECS);
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(AUTO_START_DELAY_SECS)).await;
            match coordinator.start().await {
                Ok(id) => info!(session = %id, "Auto-started stream"),
                Err(e) => error!("Auto-start failed: {}", e),
            }
        });
    }

    tokio::select! {
        result = &mut server => {
            // The server only returns early on a bind or serve error.
            coordinator.stop().await.ok();
            result.context("HTTP server task panicked")??;
            return Ok(());
        }
        signal = shutdown_signal() => {
            info!("Received {}, shutting down gracefully", signal);
        }
    }

    match coordinator.stop().await {
        Ok(outcome) => info!(?outcome, "Stream session stopped"),
        Err(e) => warn!("Stopping stream during shutdown failed: {}", e),
    }
    shutdown_tx.send_replace(true);
    server.await.context("HTTP server task panicked")??;
    Ok(())
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
