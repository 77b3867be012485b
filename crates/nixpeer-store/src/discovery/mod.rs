//! Discovery store: finds NARs on other instances over UDP broadcast.
//!
//! Every instance runs one of these on the same UDP port. A lookup
//! broadcasts a query carrying a fresh index and the hash, then waits a
//! short, fixed time for the first answer. Peers that hold the hash in
//! their local store answer with the index, their HTTP port and the path
//! of the record on their front end. The record is then fetched over HTTP
//! and its URL rewritten into a [`PeerRoute`] so the NAR can later be
//! streamed straight from that peer.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use nixpeer_core::config::PeerConfig;
use nixpeer_core::wire::{Packet, MAX_DATAGRAM};
use nixpeer_core::{CacheInfo, NarInfo};

use crate::store::{NarStream, Store, StoreError};

pub mod neighbourhood;
pub mod pending;
mod route;

pub use neighbourhood::{LanNeighbourhood, Neighbourhood, StaticNeighbourhood};
pub use pending::{Answer, PendingQueries, PendingQuery};
pub use route::PeerRoute;

/// Largest hash that still fits a query datagram.
const MAX_HASH_LEN: usize = MAX_DATAGRAM - 5;

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Local address of the discovery socket.
    pub bind: SocketAddrV4,
    /// HTTP port advertised in our answers.
    pub http_port: u16,
    /// How long a query waits for the first answer.
    pub timeout: Duration,
    /// Connect timeout for fetches against peers.
    pub connect_timeout: Duration,
    /// Limit on a whole record fetch, and on a NAR response's headers.
    pub request_timeout: Duration,
    /// Front-end prefix our answers point under.
    pub advertise_prefix: String,
}

impl DiscoverySettings {
    pub fn from_config(config: &PeerConfig) -> Self {
        Self {
            bind: SocketAddrV4::new(config.network.bind_addr, config.network.discovery_port),
            http_port: config.network.http_port,
            timeout: config.discovery.timeout(),
            connect_timeout: config.discovery.connect_timeout(),
            request_timeout: config.discovery.request_timeout(),
            advertise_prefix: config.discovery.advertise_prefix.clone(),
        }
    }
}

/// State shared by the store, its receive loop and its answer tasks.
struct Shared {
    socket: UdpSocket,
    pending: Arc<PendingQueries>,
    local: Arc<dyn Store>,
    neighbourhood: Arc<dyn Neighbourhood>,
    client: reqwest::Client,
    settings: DiscoverySettings,
}

pub struct DiscoveryStore {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryStore {
    /// Bind the discovery socket and start answering queries from `local`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        settings: DiscoverySettings,
        local: Arc<dyn Store>,
        neighbourhood: Arc<dyn Neighbourhood>,
    ) -> Result<Self, StoreError> {
        let socket = make_socket(settings.bind)?;
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()?;

        let shared = Arc::new(Shared {
            socket,
            pending: PendingQueries::new(),
            local,
            neighbourhood,
            client,
            settings,
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let listener = Listener {
            shared: Arc::clone(&shared),
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(listener.run());

        Ok(Self {
            shared,
            shutdown_tx,
            listener: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    /// Queries currently waiting for an answer.
    pub fn pending_queries(&self) -> usize {
        self.shared.pending.len()
    }

    /// Stop the receive loop and wait for it to exit. Queries in flight
    /// run into their own timeout.
    pub async fn shutdown(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else { return };

        let _ = self.shutdown_tx.send(());
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "discovery listener ended abnormally");
        }
    }
}

impl Drop for DiscoveryStore {
    fn drop(&mut self) {
        let handle = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl Store for DiscoveryStore {
    async fn cache_info(&self) -> CacheInfo {
        self.shared.local.cache_info().await
    }

    async fn nar_info(&self, hash: &str) -> Result<Option<NarInfo>, StoreError> {
        self.shared.query(hash).await
    }

    async fn nar(&self, url: &str) -> Result<NarStream, StoreError> {
        let Some(route) = PeerRoute::parse(url) else {
            tracing::debug!(url, "malformed peer route");
            return Err(StoreError::NotFound);
        };

        match self.shared.fetch(&route).await {
            Err(e) if e.is_dead_route() => {
                tracing::warn!(%route, error = %e, "dead route, rediscovering");
                let fresh = match self.shared.query(&route.hash).await {
                    Ok(Some(info)) => PeerRoute::parse(&info.url).ok_or(StoreError::NotFound)?,
                    Ok(None) => return Err(StoreError::NotFound),
                    Err(e) => {
                        tracing::warn!(hash = %route.hash, error = %e, "rediscovery failed");
                        return Err(StoreError::NotFound);
                    }
                };
                tracing::info!(old = %route, new = %fresh, "retrying on rediscovered route");
                self.shared.fetch(&fresh).await
            }
            other => other,
        }
    }
}

// ── Query side ────────────────────────────────────────────────────────────────

impl Shared {
    async fn query(&self, hash: &str) -> Result<Option<NarInfo>, StoreError> {
        if !is_queryable(hash) {
            tracing::debug!(hash, "not querying for unroutable hash");
            return Ok(None);
        }

        let pending = self.pending.register();
        let index = pending.index();
        let packet = Packet::Query {
            index,
            hash: hash.to_string(),
        }
        .encode();

        let targets = self.neighbourhood.broadcast_targets();
        tracing::debug!(hash, index, targets = targets.len(), "querying neighbourhood");
        for target in targets {
            if let Err(e) = self.socket.send_to(&packet, target).await {
                tracing::debug!(%target, error = %e, "query send failed");
            }
        }

        let Some(answer) = pending.wait(self.settings.timeout).await else {
            tracing::debug!(hash, index, "no peer answered");
            return Ok(None);
        };

        let peer = SocketAddr::new(answer.addr, answer.port);
        tracing::info!(hash, %peer, path = %answer.path, "peer answered");

        let response = self
            .client
            .get(format!("http://{peer}/{}", answer.path))
            .timeout(self.settings.request_timeout)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            tracing::debug!(hash, %peer, status = %response.status(), "peer record unavailable");
            return Ok(None);
        }
        let info = NarInfo::parse(&response.text().await?)?;

        let route = PeerRoute {
            addr: answer.addr,
            port: answer.port,
            hash: hash.to_string(),
            path: info.url.clone(),
        };
        Ok(Some(info.with_url(route.to_string())))
    }

    async fn fetch(&self, route: &PeerRoute) -> Result<NarStream, StoreError> {
        // Only the wait for headers is bounded; the body may take as long
        // as the NAR needs.
        let send = self.client.get(route.http_url()).send();
        let response = tokio::time::timeout(self.settings.request_timeout, send).await??;
        if response.status() != StatusCode::OK {
            tracing::debug!(%route, status = %response.status(), "peer has no such nar");
            return Err(StoreError::NotFound);
        }
        tracing::info!(%route, "streaming nar from peer");
        Ok(response.bytes_stream().map_err(StoreError::from).boxed())
    }
}

/// Hashes end up as a path segment of a route, so they cannot contain `/`.
fn is_queryable(hash: &str) -> bool {
    !hash.is_empty() && hash.len() <= MAX_HASH_LEN && !hash.contains('/')
}

// ── Answer side ───────────────────────────────────────────────────────────────

struct Listener {
    shared: Arc<Shared>,
    shutdown: broadcast::Receiver<()>,
}

impl Listener {
    async fn run(mut self) {
        // One spare byte so oversized datagrams show up as such instead of
        // being silently truncated.
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];

        tracing::info!(
            addr = %self.shared.settings.bind,
            http_port = self.shared.settings.http_port,
            "discovery listener starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("discovery listener shutting down");
                    return;
                }

                result = self.shared.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    if len > MAX_DATAGRAM {
                        tracing::debug!(%from, len, "dropping oversized datagram");
                        continue;
                    }
                    self.handle_datagram(&buf[..len], from);
                }
            }
        }
    }

    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        if self.shared.neighbourhood.is_local(from.ip()) {
            tracing::trace!(%from, "ignoring own datagram");
            return;
        }

        match Packet::decode(data) {
            Ok(Packet::Query { index, hash }) => {
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move { shared.answer(index, hash, from).await });
            }
            Ok(Packet::Answer { index, port, path }) => {
                let answer = Answer {
                    addr: from.ip(),
                    port,
                    path,
                };
                if !self.shared.pending.resolve(index, answer) {
                    tracing::trace!(%from, index, "answer for no pending query");
                }
            }
            Err(e) => {
                tracing::debug!(%from, error = %e, "dropping malformed datagram");
            }
        }
    }
}

impl Shared {
    async fn answer(&self, index: u32, hash: String, from: SocketAddr) {
        tracing::debug!(%from, index, hash = %hash, "query from peer");

        match self.local.nar_info(&hash).await {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(hash = %hash, error = %e, "local lookup failed");
                return;
            }
        }

        let packet = Packet::Answer {
            index,
            port: self.settings.http_port,
            path: Packet::answer_path(&self.settings.advertise_prefix, &hash),
        }
        .encode();

        match self.socket.send_to(&packet, from).await {
            Ok(_) => tracing::debug!(%from, index, hash = %hash, "answered"),
            Err(e) => tracing::warn!(%from, error = %e, "answer send failed"),
        }
    }
}

fn make_socket(bind: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(bind).into())?;
    UdpSocket::from_std(socket.into())
}
