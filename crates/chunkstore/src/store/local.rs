//! LocalStore: the MemStore cache in front of the durable DbStore.
//!
//! Reads go cache → database → optional fallback tier; hits from a lower tier
//! are copied upward. Writes reach the cache only after the database accepts
//! them, and chunks larger than [`MAX_CHUNK_LEN`] are refused.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use super::{ChunkStore, DbStore, MemStore};
use crate::address::Address;
use crate::chunk::{Chunk, MAX_CHUNK_LEN};
use crate::config::StoreParams;
use crate::error::{Result, StoreError};

pub struct LocalStore {
    mem: RwLock<Arc<MemStore>>,
    db: DbStore,
    fallback: Option<Arc<dyn ChunkStore>>,
}

impl LocalStore {
    pub fn new(mem: MemStore, db: DbStore) -> Self {
        Self {
            mem: RwLock::new(Arc::new(mem)),
            db,
            fallback: None,
        }
    }

    /// Open the database under `params.data_dir` with a fresh cache.
    pub fn open(params: &StoreParams) -> Result<Self> {
        let db = DbStore::open(params.db_path(), params.db_capacity)?;
        Ok(Self::new(MemStore::new(params.cache_capacity), db))
    }

    /// Install a tier consulted after a database miss, such as a network fetcher.
    pub fn with_fallback(mut self, fallback: Arc<dyn ChunkStore>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// The current cache tier.
    pub fn mem(&self) -> Arc<MemStore> {
        // swapping an Arc cannot leave the slot half-written
        self.mem
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn db(&self) -> &DbStore {
        &self.db
    }

    /// Swap in a new cache tier, returning the old one. Durable contents are untouched.
    pub fn replace_cache(&self, mem: MemStore) -> Arc<MemStore> {
        let mut slot = self.mem.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, Arc::new(mem))
    }
}

#[async_trait]
impl ChunkStore for LocalStore {
    async fn put(&self, chunk: Chunk) -> Result<()> {
        if !chunk.is_within_bounds() {
            warn!(
                address = %chunk.address(),
                len = chunk.len(),
                max = MAX_CHUNK_LEN,
                "refusing oversized chunk"
            );
            return Err(StoreError::InvalidChunk(*chunk.address()));
        }
        self.db.put(chunk.clone()).await?;
        self.mem().insert(chunk);
        Ok(())
    }

    async fn get(&self, address: &Address) -> Result<Chunk> {
        let mem = self.mem();
        if let Some(chunk) = mem.lookup(address) {
            return Ok(chunk);
        }

        match self.db.get(address).await {
            Ok(chunk) => {
                mem.insert(chunk.clone());
                return Ok(chunk);
            }
            Err(err) if err.is_not_found() => {}
            Err(StoreError::InvalidChunk(_)) if self.fallback.is_some() => {}
            Err(err) => return Err(err),
        }

        let Some(fallback) = &self.fallback else {
            return Err(StoreError::NotFound(*address));
        };

        let chunk = fallback.get(address).await?;
        if chunk.address() != address || !chunk.verify() || !chunk.is_within_bounds() {
            warn!(address = %address, len = chunk.len(), "fallback tier returned an invalid chunk");
            return Err(StoreError::InvalidChunk(*address));
        }
        debug!(address = %address.short(), "fetched chunk from fallback tier");
        self.db.put(chunk.clone()).await?;
        mem.insert(chunk.clone());
        Ok(chunk)
    }

    async fn has(&self, address: &Address) -> Result<bool> {
        if self.mem().lookup(address).is_some() {
            return Ok(true);
        }
        self.db.has(address).await
    }
}
