//! MemStore: capacity-bounded LRU cache of chunks.
//!
//! Recency is a monotonically increasing tick per entry; `order` maps ticks
//! back to addresses so the oldest entry is always `order`'s first key.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

use super::ChunkStore;
use crate::address::Address;
use crate::chunk::Chunk;
use crate::error::{Result, StoreError};

#[derive(Debug, Default)]
struct LruState {
    capacity: usize,
    tick: u64,
    entries: HashMap<Address, (Chunk, u64)>,
    order: BTreeMap<u64, Address>,
}

impl LruState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, address: &Address) -> Option<Chunk> {
        let tick = self.next_tick();
        let (chunk, last) = self.entries.get_mut(address)?;
        let previous = std::mem::replace(last, tick);
        let chunk = chunk.clone();
        self.order.remove(&previous);
        self.order.insert(tick, *address);
        Some(chunk)
    }

    fn evict_to(&mut self, limit: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > limit {
            let Some((_, address)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&address);
            trace!(address = %address.short(), "evicted chunk from cache");
            evicted += 1;
        }
        evicted
    }
}

/// Volatile chunk cache, bounded by a number of chunks.
///
/// Never an authority: a miss means "try the next tier". Eviction is silent.
#[derive(Debug)]
pub struct MemStore {
    state: Mutex<LruState>,
}

impl MemStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                capacity,
                ..LruState::default()
            }),
        }
    }

    // The cache keeps no cross-entry invariants a panicking holder could break.
    fn lock(&self) -> MutexGuard<'_, LruState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or refresh a chunk, evicting least-recently-used entries if full.
    /// A zero-capacity cache retains nothing.
    pub fn insert(&self, chunk: Chunk) {
        let mut state = self.lock();
        if state.capacity == 0 {
            return;
        }
        let address = *chunk.address();
        let tick = state.next_tick();
        if let Some((_, previous)) = state.entries.insert(address, (chunk, tick)) {
            state.order.remove(&previous);
        }
        state.order.insert(tick, address);
        let limit = state.capacity;
        state.evict_to(limit);
    }

    /// Look up a chunk and mark it most recently used.
    pub fn lookup(&self, address: &Address) -> Option<Chunk> {
        self.lock().touch(address)
    }

    /// Resize the cache. Shrinking evicts immediately; zero drops everything.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.lock();
        state.capacity = capacity;
        let evicted = state.evict_to(capacity);
        debug!(capacity, evicted, "cache capacity changed");
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }
}

#[async_trait]
impl ChunkStore for MemStore {
    async fn put(&self, chunk: Chunk) -> Result<()> {
        self.insert(chunk);
        Ok(())
    }

    async fn get(&self, address: &Address) -> Result<Chunk> {
        self.lookup(address).ok_or(StoreError::NotFound(*address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn chunk(n: u32) -> Chunk {
        Chunk::new(format!("chunk {n}").into_bytes())
    }

    #[test]
    fn test_insert_and_lookup() {
        let store = MemStore::new(10);
        let c = chunk(1);
        store.insert(c.clone());
        assert_eq!(store.lookup(c.address()), Some(c));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_miss_is_none() {
        let store = MemStore::new(10);
        assert!(store.lookup(chunk(1).address()).is_none());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let store = MemStore::new(2);
        let (a, b, c) = (chunk(1), chunk(2), chunk(3));
        store.insert(a.clone());
        store.insert(b.clone());

        // touching `a` leaves `b` as the oldest
        assert!(store.lookup(a.address()).is_some());
        store.insert(c.clone());

        assert_eq!(store.len(), 2);
        assert!(store.lookup(a.address()).is_some());
        assert!(store.lookup(b.address()).is_none());
        assert!(store.lookup(c.address()).is_some());
    }

    #[test]
    fn test_reinsert_refreshes_without_duplicating() {
        let store = MemStore::new(2);
        let (a, b, c) = (chunk(1), chunk(2), chunk(3));
        store.insert(a.clone());
        store.insert(b.clone());
        store.insert(a.clone());
        store.insert(c.clone());

        assert_eq!(store.len(), 2);
        assert!(store.lookup(a.address()).is_some());
        assert!(store.lookup(b.address()).is_none());
    }

    #[test]
    fn test_zero_capacity_retains_nothing() {
        let store = MemStore::new(0);
        let c = chunk(1);
        store.insert(c.clone());
        assert!(store.is_empty());
        assert!(store.lookup(c.address()).is_none());
    }

    #[test]
    fn test_set_capacity_shrinks() {
        let store = MemStore::new(10);
        for n in 0..10 {
            store.insert(chunk(n));
        }
        store.set_capacity(3);
        assert_eq!(store.len(), 3);
        assert_eq!(store.capacity(), 3);
        // the three newest survive
        for n in 7..10 {
            assert!(store.lookup(chunk(n).address()).is_some());
        }
    }

    #[test]
    fn test_set_capacity_zero_drops_all() {
        let store = MemStore::new(10);
        let c = chunk(1);
        store.insert(c.clone());
        store.set_capacity(0);
        assert!(store.is_empty());
        assert!(store.lookup(c.address()).is_none());
    }

    #[test]
    fn test_clear() {
        let store = MemStore::new(10);
        store.insert(chunk(1));
        store.insert(chunk(2));
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.capacity(), 10);
    }

    #[test]
    fn test_concurrent_inserts() {
        let store = Arc::new(MemStore::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                thread::spawn(move || {
                    for n in 0..100 {
                        let c = chunk(t * 100 + n);
                        store.insert(c.clone());
                        assert!(store.lookup(c.address()).is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 800);
    }

    #[tokio::test]
    async fn test_trait_get_not_found() {
        let store = MemStore::new(4);
        let address = *chunk(9).address();
        let err = store.get(&address).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.has(&address).await.unwrap());
    }

    #[tokio::test]
    async fn test_trait_put_then_get() {
        let store = MemStore::new(4);
        let c = chunk(5);
        store.put(c.clone()).await.unwrap();
        assert_eq!(store.get(c.address()).await.unwrap(), c);
    }
}
