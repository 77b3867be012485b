//! Configuration system for nixpeer.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $NIXPEER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/nixpeer/config.toml
//!   3. ~/.config/nixpeer/config.toml

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::DISCOVERY_PORT;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub local: LocalConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port of the HTTP front end. Also advertised to peers in answers.
    pub http_port: u16,
    /// UDP port shared by every instance on the broadcast domain.
    pub discovery_port: u16,
    /// Address both listeners bind to.
    pub bind_addr: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// How long a query waits for the first answer.
    pub timeout_ms: u64,
    /// Connect timeout for HTTP fetches against peers.
    pub connect_timeout_ms: u64,
    /// Limit on a whole record fetch, and on waiting for NAR response
    /// headers, from a peer.
    pub request_timeout_ms: u64,
    /// Path prefix under which answers point at our local store.
    pub advertise_prefix: String,
    /// Fixed peer addresses to query in addition to (or, when
    /// `broadcast` is false, instead of) interface broadcast addresses.
    pub static_peers: Vec<Ipv4Addr>,
    pub broadcast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// URL of an already running nix-serve. Empty = launch one.
    pub server_url: String,
    /// nix-serve binary used when launching.
    pub nix_serve: String,
    /// Loopback port the launched nix-serve listens on.
    pub server_port: u16,
    /// Readiness probes before startup is abandoned, one per second.
    pub startup_attempts: u32,
    /// Store directory reported when nix-serve cannot be asked.
    pub store_dir: String,
    /// Command producing a NAR on stdout; the store path is appended.
    pub dump_command: Vec<String>,
    /// Limit on each request to nix-serve.
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Priority advertised in /nix-cache-info.
    pub priority: i32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_port: 12304,
            discovery_port: DISCOVERY_PORT,
            bind_addr: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 50,
            connect_timeout_ms: 2000,
            request_timeout_ms: 5000,
            advertise_prefix: "local".to_string(),
            static_peers: Vec::new(),
            broadcast: true,
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            nix_serve: "nix-serve".to_string(),
            server_port: 12305,
            startup_attempts: 10,
            store_dir: "/nix/store".to_string(),
            dump_command: vec![
                "nix".to_string(),
                "dump-path".to_string(),
                "--".to_string(),
            ],
            request_timeout_ms: 5000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { priority: 20 }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl LocalConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("nixpeer")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PeerConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults when it is absent.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            PeerConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("NIXPEER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PeerConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply NIXPEER_* overrides. `lookup` is `std::env::var` outside tests.
    /// Values that fail to parse are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(p) = lookup("NIXPEER_NETWORK__HTTP_PORT").and_then(|v| v.parse().ok()) {
            self.network.http_port = p;
        }
        if let Some(p) = lookup("NIXPEER_NETWORK__DISCOVERY_PORT").and_then(|v| v.parse().ok()) {
            self.network.discovery_port = p;
        }
        if let Some(a) = lookup("NIXPEER_NETWORK__BIND_ADDR").and_then(|v| v.parse().ok()) {
            self.network.bind_addr = a;
        }
        if let Some(t) = lookup("NIXPEER_DISCOVERY__TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.discovery.timeout_ms = t;
        }
        if let Some(url) = lookup("NIXPEER_LOCAL__SERVER_URL") {
            self.local.server_url = url;
        }
        if let Some(p) = lookup("NIXPEER_CACHE__PRIORITY").and_then(|v| v.parse().ok()) {
            self.cache.priority = p;
        }
    }
}
