//! Local store: serves what the local Nix store already has.
//!
//! Metadata comes from a nix-serve instance on loopback. NAR bytes do not go
//! through nix-serve: the record's URL is replaced by a token that encodes
//! the store path, and opening that token runs the archive producer
//! (`nix dump-path`) directly.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use reqwest::StatusCode;
use std::path::{Component, Path};
use std::time::Duration;
use tokio::sync::OnceCell;

use nixpeer_core::config::LocalConfig;
use nixpeer_core::{CacheInfo, NarInfo};

use crate::store::{NarStream, Store, StoreError};

pub mod dump;
pub mod server;

pub use server::LocalServer;

/// Per-request limit on nix-serve unless configured otherwise.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LocalStore {
    client: reqwest::Client,
    timeout: Duration,
    base_url: String,
    store_dir: String,
    dump_command: Vec<String>,
    cache_info: OnceCell<CacheInfo>,
}

impl LocalStore {
    /// `base_url` points at nix-serve. `store_dir` is only reported while
    /// nix-serve cannot be asked for its own.
    pub fn new(
        base_url: impl Into<String>,
        store_dir: impl Into<String>,
        dump_command: Vec<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: DEFAULT_TIMEOUT,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store_dir: store_dir.into(),
            dump_command,
            cache_info: OnceCell::new(),
        }
    }

    /// Bound every nix-serve request, so a server that accepts but never
    /// replies yields fallbacks instead of a hang.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(server: &LocalServer, config: &LocalConfig) -> Self {
        Self::new(
            server.url(),
            config.store_dir.clone(),
            config.dump_command.clone(),
        )
        .with_timeout(config.request_timeout())
    }

    async fn fetch_cache_info(&self) -> Result<CacheInfo, StoreError> {
        let text = self
            .client
            .get(format!("{}/nix-cache-info", self.base_url))
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(CacheInfo::parse(&text)?)
    }

    /// Resolve a token back to a store path that exists under the store dir.
    async fn resolve(&self, url: &str) -> Option<String> {
        let path = decode_token(url)?;
        let store_dir = self.cache_info().await.store_dir;
        if !within(&path, &store_dir) {
            tracing::warn!(path = %path, store_dir = %store_dir, "rejected nar request outside the store");
            return None;
        }
        tokio::fs::symlink_metadata(&path).await.ok().map(|_| path)
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn cache_info(&self) -> CacheInfo {
        match self
            .cache_info
            .get_or_try_init(|| self.fetch_cache_info())
            .await
        {
            Ok(info) => info.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "nix-cache-info unavailable, using defaults");
                CacheInfo::fallback(self.store_dir.clone())
            }
        }
    }

    async fn nar_info(&self, hash: &str) -> Result<Option<NarInfo>, StoreError> {
        if !is_valid_hash(hash) {
            return Ok(None);
        }

        let resp = self
            .client
            .get(format!("{}/{}.narinfo", self.base_url, hash))
            .timeout(self.timeout)
            .send()
            .await?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(None),
            status => {
                tracing::warn!(hash, %status, "unexpected narinfo status from nix-serve");
                return Ok(None);
            }
        }

        let info = NarInfo::parse(&resp.text().await?)?;
        let url = encode_token(&info.store_path);
        Ok(Some(info.with_url(url)))
    }

    async fn nar(&self, url: &str) -> Result<NarStream, StoreError> {
        let path = self.resolve(url).await.ok_or(StoreError::NotFound)?;
        dump::dump(&self.dump_command, &path)
    }
}

// ── Tokens ────────────────────────────────────────────────────────────────────

/// Opaque, path-safe URL for a store path. URL-safe base64 never contains
/// `/`, so the token is always a single path segment.
pub fn encode_token(store_path: &str) -> String {
    format!("{}.nar", URL_SAFE.encode(store_path))
}

pub fn decode_token(token: &str) -> Option<String> {
    let token = token.strip_suffix(".nar").unwrap_or(token);
    let bytes = URL_SAFE.decode(token).ok()?;
    String::from_utf8(bytes).ok()
}

/// Component-wise containment; any `..` disqualifies the path.
fn within(path: &str, store_dir: &str) -> bool {
    let path = Path::new(path);
    !store_dir.is_empty()
        && path.is_absolute()
        && path.starts_with(store_dir)
        && path != Path::new(store_dir)
        && !path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Store hashes are base32, which is plain ASCII alphanumerics.
fn is_valid_hash(hash: &str) -> bool {
    !hash.is_empty() && hash.chars().all(|c| c.is_ascii_alphanumeric())
}
