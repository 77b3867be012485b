//! Local artifact server: the nix-serve process the local store talks to.

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::store::StoreError;

/// Interval between readiness probes while nix-serve starts.
pub const STARTUP_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// A nix-serve instance, either launched by us or already running.
pub struct LocalServer {
    child: Option<Child>,
    url: String,
}

impl LocalServer {
    /// Launch `nix_serve --listen 127.0.0.1:<port>` and wait until it accepts
    /// connections. Failing to come up within `attempts` probes is fatal.
    pub async fn launch(nix_serve: &str, port: u16, attempts: u32) -> Result<Self, StoreError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listen = addr.to_string();
        tracing::info!(%addr, "launching nix-serve");
        Self::launch_with(nix_serve, &["--listen", &listen], addr, attempts, STARTUP_PROBE_INTERVAL)
            .await
    }

    /// Use a server someone else runs. Nothing is terminated on shutdown.
    pub fn external(url: impl Into<String>) -> Self {
        Self {
            child: None,
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn launch_with(
        program: &str,
        args: &[&str],
        addr: SocketAddr,
        attempts: u32,
        interval: Duration,
    ) -> Result<Self, StoreError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StoreError::Startup(format!("failed to spawn {program}: {e}")))?;

        for attempt in 1..=attempts {
            if TcpStream::connect(addr).await.is_ok() {
                tracing::info!(%addr, attempt, "local server ready");
                return Ok(Self {
                    child: Some(child),
                    url: format!("http://{addr}"),
                });
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(StoreError::Startup(format!("{program} exited early: {status}")));
            }
            tracing::debug!(%addr, attempt, "local server not reachable yet");
            tokio::time::sleep(interval).await;
        }

        Err(StoreError::Startup(format!(
            "{program} not reachable on {addr} after {attempts} attempts"
        )))
    }

    /// Base URL of the server, without a trailing slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Terminate a launched server. Errors for an already exited process
    /// are swallowed.
    pub async fn shutdown(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            tracing::info!("nix-serve exited");
        }
    }
}
