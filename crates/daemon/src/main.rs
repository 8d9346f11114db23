// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Daemon
// Hosts dev tunnels on the relay and exposes a loopback control API

mod api;
mod config;
mod error;
mod forwarder;
mod host;
mod management;
mod refresh_lock;
mod registry;
mod relay;
mod session;
mod token;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devtunnel_host_common::HostEvent;

use api::{create_router, AppState};
use config::DaemonConfig;
use management::HttpManagementClient;
use registry::HostRegistry;
use relay::WebSocketRelayConnector;
use token::{DevTunnelCli, TokenStore};

#[tokio::main]
async fn main() -> Result<()> {
    let daemon_config = DaemonConfig::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "devtunnel_host_daemon={},tower_http=debug",
                    daemon_config.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Devtunnel Host Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let protocols = daemon_config.protocols();
    info!(
        "Relay protocols: {}",
        protocols
            .iter()
            .map(|p| p.subprotocol())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let event_tx = HostRegistry::event_channel();

    // Log every host event
    let mut event_rx = event_tx.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(HostEvent::LoginOutput { .. }) => {}
                Ok(event) => info!("Host event: {:?}", event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event logger lagged by {} events", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let tokens = TokenStore::new(
        Arc::new(DevTunnelCli::new(daemon_config.devtunnel_path.clone())),
        daemon_config.token_lock_timeout(),
        event_tx.clone(),
    );
    let management = HttpManagementClient::new(daemon_config.management_settings(), tokens.clone())
        .context("Failed to create management client")?;
    let connector = WebSocketRelayConnector::new(daemon_config.user_agent.clone());

    let registry = HostRegistry::new(
        Arc::new(management),
        Arc::new(connector),
        tokens,
        daemon_config.host_options(),
        daemon_config.default_cluster.clone(),
        event_tx,
    );

    // Closes SSE streams on shutdown
    let (shutdown_tx, _) = broadcast::channel(1);

    let state = Arc::new(AppState {
        registry: registry.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let bind_address = daemon_config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    info!("Daemon listening on http://{}", bind_address);
    info!("Daemon started successfully");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry, shutdown_tx))
        .await
        .context("HTTP server error")?;

    info!("Daemon shut down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, dispose every host, then close event streams
async fn shutdown_signal(registry: HostRegistry, shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }

    registry.stop_all().await;
    info!("All hosts stopped");

    let _ = shutdown_tx.send(());
}
