//! Chunk storage tiers.
//!
//! Every tier implements [`ChunkStore`]: a volatile LRU cache ([`MemStore`]),
//! a durable SQLite-backed store ([`DbStore`]), and the composite
//! [`LocalStore`] that reads through the cache into the database.
//!
//! The chunker only sees `Arc<dyn ChunkStore>`, so any tier (or anything
//! else implementing the trait, like a network fetcher) can sit underneath a
//! split or a join.

use async_trait::async_trait;
use std::sync::Arc;

use crate::address::Address;
use crate::chunk::Chunk;
use crate::error::Result;

mod db;
mod local;
mod mem;

pub use db::DbStore;
pub use local::LocalStore;
pub use mem::MemStore;

/// Minimal put/get capability shared by all storage tiers.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store a chunk. Re-putting an address that is already present is a no-op.
    async fn put(&self, chunk: Chunk) -> Result<()>;

    /// Fetch a chunk by address.
    ///
    /// Returns `Err(StoreError::NotFound)` when this tier does not hold it.
    async fn get(&self, address: &Address) -> Result<Chunk>;

    /// Check for a chunk without caring about its bytes.
    async fn has(&self, address: &Address) -> Result<bool> {
        match self.get(address).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl<S: ChunkStore + ?Sized> ChunkStore for Arc<S> {
    async fn put(&self, chunk: Chunk) -> Result<()> {
        (**self).put(chunk).await
    }

    async fn get(&self, address: &Address) -> Result<Chunk> {
        (**self).get(address).await
    }

    async fn has(&self, address: &Address) -> Result<bool> {
        (**self).has(address).await
    }
}
