//! In-memory store used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use nixpeer_core::{CacheInfo, Compression, NarInfo};

use crate::store::{NarStream, Store, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    infos: HashMap<String, NarInfo>,
    nars: HashMap<String, Vec<u8>>,
    lookups: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nar(mut self, hash: &str, url: &str, bytes: &[u8]) -> Self {
        self.infos.insert(hash.to_string(), narinfo(hash, url, bytes.len() as u64));
        self.nars.insert(url.to_string(), bytes.to_vec());
        self
    }

    /// Number of `nar_info` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

pub fn narinfo(hash: &str, url: &str, size: u64) -> NarInfo {
    NarInfo {
        store_path: format!("/nix/store/{hash}-test"),
        url: url.to_string(),
        compression: Compression::None,
        nar_hash: format!("sha256:{hash}"),
        nar_size: size,
        references: Vec::new(),
        deriver: None,
        signatures: Vec::new(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn cache_info(&self) -> CacheInfo {
        CacheInfo {
            store_dir: "/nix/store".to_string(),
            want_mass_query: 1,
            priority: 40,
        }
    }

    async fn nar_info(&self, hash: &str) -> Result<Option<NarInfo>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.infos.get(hash).cloned())
    }

    async fn nar(&self, url: &str) -> Result<NarStream, StoreError> {
        let bytes = self.nars.get(url).ok_or(StoreError::NotFound)?.clone();
        Ok(Box::pin(futures::stream::iter([Ok(Bytes::from(bytes))])))
    }
}
