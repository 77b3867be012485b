//! nixpeerd: peer-to-peer Nix binary cache.
//!
//! Serves this machine's store to the LAN and, for the local Nix daemon,
//! finds store paths on other machines running nixpeerd.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use nixpeer_api::ApiState;
use nixpeer_core::config::PeerConfig;
use nixpeer_store::{
    DiscoverySettings, DiscoveryStore, LanNeighbourhood, LocalServer, LocalStore, PrefixStore,
    Store,
};

/// How long in-flight transfers may continue after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PeerConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PeerConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PeerConfig::default()
    });

    tracing::info!(
        http_port = config.network.http_port,
        discovery_port = config.network.discovery_port,
        "nixpeerd starting"
    );

    let server = if config.local.server_url.is_empty() {
        LocalServer::launch(
            &config.local.nix_serve,
            config.local.server_port,
            config.local.startup_attempts,
        )
        .await
        .context("failed to start nix-serve")?
    } else {
        tracing::info!(url = %config.local.server_url, "using external nix-serve");
        LocalServer::external(config.local.server_url.as_str())
    };

    let result = run(&config, &server).await;
    server.shutdown().await;
    result
}

async fn run(config: &PeerConfig, server: &LocalServer) -> Result<()> {
    // ── Stores ───────────────────────────────────────────────────────────────

    let local: Arc<dyn Store> = Arc::new(LocalStore::from_config(server, &config.local));

    let neighbourhood = LanNeighbourhood::new(config.network.discovery_port).with_static_peers(
        config.discovery.static_peers.clone(),
        config.discovery.broadcast,
    );
    let discovery = Arc::new(
        DiscoveryStore::bind(
            DiscoverySettings::from_config(config),
            Arc::clone(&local),
            Arc::new(neighbourhood),
        )
        .context("failed to bind discovery socket")?,
    );

    let state = ApiState {
        local: Arc::new(PrefixStore::new("local/nar", Arc::clone(&local))),
        remote: Arc::new(PrefixStore::new("v2/remote", Arc::clone(&discovery))),
        priority: config.cache.priority,
    };

    // ── HTTP ─────────────────────────────────────────────────────────────────

    let addr = SocketAddr::from((config.network.bind_addr, config.network.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http listener on {addr}"))?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut http_shutdown = shutdown_tx.subscribe();
    let mut http_task = tokio::spawn(nixpeer_api::serve(state, listener, async move {
        let _ = http_shutdown.recv().await;
    }));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let exited_early = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
            None
        }
        r = &mut http_task => Some(r),
    };

    let _ = shutdown_tx.send(());
    discovery.shutdown().await;

    match exited_early {
        Some(r) => {
            r.context("http server task failed")??;
            bail!("http server exited unexpectedly");
        }
        None => match tokio::time::timeout(SHUTDOWN_GRACE, http_task).await {
            Ok(r) => r.context("http server task failed")?,
            Err(_) => {
                tracing::warn!("in-flight transfers cut off at shutdown");
                Ok(())
            }
        },
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
