//! nixpeer integration test harness.
//!
//! Every test builds complete nodes on loopback: a stand-in for nix-serve
//! answering from a scratch store directory, the local and discovery
//! stores, and the HTTP front end. Nodes find each other through an
//! explicit peer list instead of interface broadcast addresses, so tests
//! run unprivileged and in parallel.
//!
//!   cargo test --test integration

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tempfile::TempDir;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use nixpeer_api::ApiState;
use nixpeer_core::wire::{Packet, MAX_DATAGRAM};
use nixpeer_core::{Compression, NarInfo};
use nixpeer_store::{
    DiscoverySettings, DiscoveryStore, LocalStore, Neighbourhood, PrefixStore, Store,
};

mod discovery;
mod local;

/// Discovery wait used by every node.
pub const QUERY_TIMEOUT: Duration = Duration::from_millis(300);

// ── Neighbourhood ─────────────────────────────────────────────────────────────

/// Peer list that tests rewire after nodes are up.
#[derive(Default)]
pub struct PeerList {
    targets: RwLock<Vec<SocketAddr>>,
    local: RwLock<Vec<IpAddr>>,
}

impl PeerList {
    pub fn set(&self, targets: Vec<SocketAddr>) {
        *self.targets.write().unwrap() = targets;
    }

    /// Treat datagrams from `ip` as our own.
    pub fn claim(&self, ip: IpAddr) {
        self.local.write().unwrap().push(ip);
    }
}

impl Neighbourhood for PeerList {
    fn broadcast_targets(&self) -> Vec<SocketAddr> {
        self.targets.read().unwrap().clone()
    }

    fn is_local(&self, ip: IpAddr) -> bool {
        self.local.read().unwrap().contains(&ip)
    }
}

// ── Fake nix-serve ────────────────────────────────────────────────────────────

async fn fake_nix_serve(
    store_dir: String,
    entries: HashMap<String, NarInfo>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let cache_info = format!("StoreDir: {store_dir}\nWantMassQuery: 1\nPriority: 30\n");
    let entries = Arc::new(entries);

    let app = Router::new()
        .route("/nix-cache-info", get(move || async move { cache_info }))
        .route(
            "/{file}",
            get(move |Path(file): Path<String>| async move {
                file.strip_suffix(".narinfo")
                    .and_then(|hash| entries.get(hash))
                    .map(|info| (StatusCode::OK, info.to_string()))
                    .unwrap_or((StatusCode::NOT_FOUND, String::new()))
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((addr, task))
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// One nixpeer instance, wired the way the daemon wires it.
pub struct Node {
    pub http: SocketAddr,
    pub discovery_addr: SocketAddr,
    pub peers: Arc<PeerList>,
    discovery: Arc<DiscoveryStore>,
    shutdown_tx: broadcast::Sender<()>,
    http_task: Option<JoinHandle<Result<()>>>,
    nix_serve: JoinHandle<()>,
    store_dir: TempDir,
}

impl Node {
    /// Start a node whose store holds `content` as `(hash, nar bytes)`.
    /// The producer is `cat`, so the NAR of a path is the file itself.
    pub async fn start(content: &[(&str, &[u8])]) -> Result<Self> {
        let store_dir = tempfile::tempdir()?;
        let store_dir_str = store_dir
            .path()
            .to_str()
            .context("non-utf8 temp dir")?
            .to_string();

        let mut entries = HashMap::new();
        for (hash, bytes) in content {
            let store_path = format!("{store_dir_str}/{hash}-pkg");
            std::fs::write(&store_path, bytes)?;
            entries.insert(
                hash.to_string(),
                NarInfo {
                    store_path,
                    url: format!("nar/{hash}.nar"),
                    compression: Compression::None,
                    nar_hash: format!("sha256:{hash}"),
                    nar_size: bytes.len() as u64,
                    references: Vec::new(),
                    deriver: None,
                    signatures: Vec::new(),
                },
            );
        }
        let (nix_serve_addr, nix_serve) = fake_nix_serve(store_dir_str.clone(), entries).await?;

        let local: Arc<dyn Store> = Arc::new(LocalStore::new(
            format!("http://{nix_serve_addr}"),
            store_dir_str,
            vec!["cat".to_string()],
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let http = listener.local_addr()?;

        let peers = Arc::new(PeerList::default());
        let settings = DiscoverySettings {
            bind: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            http_port: http.port(),
            timeout: QUERY_TIMEOUT,
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            advertise_prefix: "local".to_string(),
        };
        let discovery = Arc::new(DiscoveryStore::bind(
            settings,
            Arc::clone(&local),
            Arc::clone(&peers) as Arc<dyn Neighbourhood>,
        )?);
        let discovery_addr = discovery.local_addr()?;

        let state = ApiState {
            local: Arc::new(PrefixStore::new("local/nar", Arc::clone(&local))),
            remote: Arc::new(PrefixStore::new("v2/remote", Arc::clone(&discovery))),
            priority: 20,
        };

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let http_task = tokio::spawn(nixpeer_api::serve(state, listener, async move {
            let _ = shutdown_rx.recv().await;
        }));

        Ok(Self {
            http,
            discovery_addr,
            peers,
            discovery,
            shutdown_tx,
            http_task: Some(http_task),
            nix_serve,
            store_dir,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.http, path.trim_start_matches('/'))
    }

    pub fn store_path(&self, hash: &str) -> String {
        format!("{}/{hash}-pkg", self.store_dir.path().display())
    }

    /// Take the node off the network: HTTP closed, discovery silent.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.discovery.shutdown().await;
        if let Some(task) = self.http_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        self.nix_serve.abort();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(task) = self.http_task.take() {
            task.abort();
        }
        self.nix_serve.abort();
    }
}

/// Point each node's queries at the other.
pub fn link(a: &Node, b: &Node) {
    a.peers.set(vec![b.discovery_addr]);
    b.peers.set(vec![a.discovery_addr]);
}

// ── Query spy ─────────────────────────────────────────────────────────────────

/// A silent peer that records the queries it receives.
pub struct QuerySpy {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<(u32, String)>>>,
    task: JoinHandle<()>,
}

impl QuerySpy {
    pub async fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);

        let task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            while let Ok((len, _)) = socket.recv_from(&mut buf).await {
                if let Ok(Packet::Query { index, hash }) = Packet::decode(&buf[..len]) {
                    record.lock().unwrap().push((index, hash));
                }
            }
        });

        Ok(Self { addr, seen, task })
    }

    pub fn queries(&self) -> Vec<(u32, String)> {
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for QuerySpy {
    fn drop(&mut self) {
        self.task.abort();
    }
}
