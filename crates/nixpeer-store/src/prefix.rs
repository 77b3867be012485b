//! Prefix store: mounts another store under a path segment.
//!
//! URLs coming out of the inner store get `prefix/` prepended; URLs going in
//! must carry it and have it stripped. Several prefixed stores can therefore
//! share one HTTP path space without seeing each other's URLs.

use async_trait::async_trait;

use nixpeer_core::{CacheInfo, NarInfo};

use crate::store::{NarStream, Store, StoreError};

pub struct PrefixStore<S> {
    prefix: String,
    inner: S,
}

impl<S: Store> PrefixStore<S> {
    /// `prefix` may itself contain slashes (`"local/nar"`). Leading and
    /// trailing slashes are trimmed.
    pub fn new(prefix: impl Into<String>, inner: S) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            inner,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn strip<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(self.prefix.as_str())?.strip_prefix('/')
    }
}

#[async_trait]
impl<S: Store> Store for PrefixStore<S> {
    async fn cache_info(&self) -> CacheInfo {
        self.inner.cache_info().await
    }

    async fn nar_info(&self, hash: &str) -> Result<Option<NarInfo>, StoreError> {
        let info = self.inner.nar_info(hash).await?;
        Ok(info.map(|info| {
            let url = format!("{}/{}", self.prefix, info.url);
            info.with_url(url)
        }))
    }

    async fn nar(&self, url: &str) -> Result<NarStream, StoreError> {
        match self.strip(url) {
            Some(rest) => self.inner.nar(rest).await,
            None => Err(StoreError::NotFound),
        }
    }
}
