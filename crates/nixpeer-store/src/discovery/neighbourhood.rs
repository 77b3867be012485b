//! Who to ask, and who is us.
//!
//! Queries go to the directed broadcast address of every private IPv4
//! network this host sits on. Because broadcasts loop back to the sender,
//! the same interface walk also yields the addresses whose datagrams the
//! receive loop ignores.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

pub trait Neighbourhood: Send + Sync {
    /// Where to send a query. Recomputed on every query so interface
    /// changes are picked up without a restart.
    fn broadcast_targets(&self) -> Vec<SocketAddr>;

    /// Whether `ip` belongs to this host.
    fn is_local(&self, ip: IpAddr) -> bool;
}

// ── LAN ───────────────────────────────────────────────────────────────────────

/// The real network, read from the OS interface table.
pub struct LanNeighbourhood {
    port: u16,
    broadcast: bool,
    static_peers: Vec<Ipv4Addr>,
}

/// One IPv4 address on a broadcast-capable interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv4Iface {
    addr: Ipv4Addr,
    netmask: Ipv4Addr,
}

impl Ipv4Iface {
    fn directed_broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !u32::from(self.netmask))
    }
}

impl LanNeighbourhood {
    /// `port` is the discovery port peers listen on.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            broadcast: true,
            static_peers: Vec::new(),
        }
    }

    /// Also query these addresses directly. With `broadcast` false they
    /// are the only targets.
    pub fn with_static_peers(mut self, peers: Vec<Ipv4Addr>, broadcast: bool) -> Self {
        self.static_peers = peers;
        self.broadcast = broadcast;
        self
    }

    fn interfaces() -> Vec<Ipv4Iface> {
        let addrs = match getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::warn!(error = %e, "getifaddrs failed");
                return Vec::new();
            }
        };

        addrs
            .filter(|ifa| ifa.flags.contains(InterfaceFlags::IFF_BROADCAST))
            .filter_map(|ifa| {
                let addr = ifa.address.as_ref()?.as_sockaddr_in()?.ip();
                let netmask = ifa.netmask.as_ref()?.as_sockaddr_in()?.ip();
                Some(Ipv4Iface {
                    addr: Ipv4Addr::from(addr),
                    netmask: Ipv4Addr::from(netmask),
                })
            })
            .collect()
    }

    fn targets_for(&self, ifaces: &[Ipv4Iface]) -> Vec<SocketAddr> {
        let mut targets = BTreeSet::new();
        if self.broadcast {
            targets.extend(
                ifaces
                    .iter()
                    .filter(|i| i.addr.is_private())
                    .map(Ipv4Iface::directed_broadcast),
            );
        }
        targets.extend(self.static_peers.iter().copied());
        targets
            .into_iter()
            .map(|ip| SocketAddr::from((ip, self.port)))
            .collect()
    }
}

impl Neighbourhood for LanNeighbourhood {
    fn broadcast_targets(&self) -> Vec<SocketAddr> {
        self.targets_for(&Self::interfaces())
    }

    fn is_local(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => Self::interfaces().iter().any(|i| i.addr == v4),
            IpAddr::V6(_) => false,
        }
    }
}

// ── Static ────────────────────────────────────────────────────────────────────

/// A fixed target list, for tests and unicast-only setups.
#[derive(Debug, Clone, Default)]
pub struct StaticNeighbourhood {
    targets: Vec<SocketAddr>,
    local: Vec<IpAddr>,
}

impl StaticNeighbourhood {
    pub fn new(targets: Vec<SocketAddr>) -> Self {
        Self {
            targets,
            local: Vec::new(),
        }
    }

    /// Treat datagrams from these addresses as our own.
    pub fn with_local(mut self, local: Vec<IpAddr>) -> Self {
        self.local = local;
        self
    }
}

impl Neighbourhood for StaticNeighbourhood {
    fn broadcast_targets(&self) -> Vec<SocketAddr> {
        self.targets.clone()
    }

    fn is_local(&self, ip: IpAddr) -> bool {
        self.local.contains(&ip)
    }
}
