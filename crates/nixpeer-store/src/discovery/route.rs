use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A NAR location on a peer, carried in a discovered record's `URL` as
/// `addr/port/hash/path`. The hash lets a dead route be re-discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRoute {
    pub addr: IpAddr,
    pub port: u16,
    pub hash: String,
    pub path: String,
}

impl PeerRoute {
    pub fn parse(url: &str) -> Option<Self> {
        let mut parts = url.splitn(4, '/');
        let addr = parts.next()?.parse().ok()?;
        let port = parts.next()?.parse().ok()?;
        let hash = parts.next().filter(|h| !h.is_empty())?;
        let path = parts.next().filter(|p| !p.is_empty())?;
        Some(Self {
            addr,
            port,
            hash: hash.to_string(),
            path: path.to_string(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Direct HTTP location of the NAR.
    pub fn http_url(&self) -> String {
        format!("http://{}/{}", self.peer(), self.path)
    }
}

impl fmt::Display for PeerRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.addr, self.port, self.hash, self.path)
    }
}
