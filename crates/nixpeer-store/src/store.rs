//! Store trait: the capability every backend and wrapper implements.
//!
//! A store answers three questions: what kind of cache am I
//! (`cache_info`), what do you know about this hash (`nar_info`), and give
//! me the bytes behind this URL (`nar`). The HTTP front end only ever talks
//! to `Store` values, so local, discovered and prefixed content look the
//! same from the outside.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use nixpeer_core::{CacheInfo, NarInfo, RecordError};

/// Lazily produced, forward-only NAR byte stream.
///
/// Dropping the stream tears down whatever produces it (child process or
/// peer connection).
pub type NarStream = BoxStream<'static, Result<Bytes, StoreError>>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Cache-level metadata. Never fails; backends substitute defaults.
    async fn cache_info(&self) -> CacheInfo;

    /// Metadata for `hash`. `Ok(None)` when this store does not know it.
    async fn nar_info(&self, hash: &str) -> Result<Option<NarInfo>, StoreError>;

    /// Open the NAR behind a URL previously returned by `nar_info`.
    /// `StoreError::NotFound` when the URL does not (or no longer) resolve.
    async fn nar(&self, url: &str) -> Result<NarStream, StoreError>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn cache_info(&self) -> CacheInfo {
        (**self).cache_info().await
    }

    async fn nar_info(&self, hash: &str) -> Result<Option<NarInfo>, StoreError> {
        (**self).nar_info(hash).await
    }

    async fn nar(&self, url: &str) -> Result<NarStream, StoreError> {
        (**self).nar(url).await
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The path does not resolve here, or its backing peer/process is gone.
    #[error("not found")]
    NotFound,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer accepted the connection but did not respond in time.
    #[error("timed out waiting for peer")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("malformed record: {0}")]
    Record(#[from] RecordError),

    /// The local artifact server never became reachable.
    #[error("startup failed: {0}")]
    Startup(String),
}

impl StoreError {
    /// Failures that mean "the peer behind this route is unreachable" rather
    /// than "the peer misbehaved".
    pub fn is_dead_route(&self) -> bool {
        match self {
            StoreError::NotFound | StoreError::Timeout(_) => true,
            // is_request covers pooled connections the peer already closed.
            StoreError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }
}
