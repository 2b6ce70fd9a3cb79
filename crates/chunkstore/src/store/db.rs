//! DbStore: durable chunk storage on SQLite.
//!
//! One row per chunk. `accessed` is a logical clock bumped on every put and
//! fetch; garbage collection deletes the lowest values first. Fetches queue
//! their bumps in memory and write them in one transaction every
//! [`TOUCH_BATCH`] reads, before any collection, and when the store closes.
//!
//! Thread-safe via Mutex. The async [`ChunkStore`] impl hops onto the
//! blocking pool so database I/O never stalls the runtime.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::ChunkStore;
use crate::address::Address;
use crate::chunk::Chunk;
use crate::error::{Result, StoreError};

/// Rows examined per garbage collection round.
const GC_BATCH: i64 = 256;

/// Queued recency bumps written per transaction.
const TOUCH_BATCH: usize = 64;

const SCHEMA: &str = "
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS chunks (
        address  BLOB PRIMARY KEY,
        data     BLOB NOT NULL,
        size     INTEGER NOT NULL,
        accessed INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS chunks_accessed ON chunks (accessed);
";

struct DbState {
    conn: Connection,
    size: u64,
    capacity: u64,
    clock: u64,
    touched: Vec<(Address, i64)>,
}

impl DbState {
    fn next_clock(&mut self) -> i64 {
        self.clock += 1;
        self.clock as i64
    }

    fn touch(&mut self, address: Address) -> Result<()> {
        let clock = self.next_clock();
        self.touched.push((address, clock));
        if self.touched.len() >= TOUCH_BATCH {
            self.flush_touches()?;
        }
        Ok(())
    }

    fn flush_touches(&mut self) -> Result<()> {
        if self.touched.is_empty() {
            return Ok(());
        }
        let touched = std::mem::take(&mut self.touched);
        let tx = self.conn.transaction()?;
        {
            // rows deleted since the read simply match nothing
            let mut stmt = tx.prepare_cached(
                "UPDATE chunks SET accessed = MAX(accessed, ?2) WHERE address = ?1",
            )?;
            for (address, clock) in &touched {
                stmt.execute(params![address.as_bytes().as_slice(), clock])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Usage target after a collection.
    fn low_water(&self) -> u64 {
        self.capacity - self.capacity / 10
    }

    fn delete(&mut self, address: &Address) -> Result<bool> {
        let size: Option<i64> = self
            .conn
            .query_row(
                "DELETE FROM chunks WHERE address = ?1 RETURNING size",
                [address.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        match size {
            Some(size) => {
                self.size = self.size.saturating_sub(size as u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete least-recently-accessed chunks until usage is at or below `target`.
    fn collect(&mut self, target: u64) -> Result<usize> {
        self.flush_touches()?;
        let mut evicted = 0;
        while self.size > target {
            let batch: Vec<(Vec<u8>, i64)> = {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT address, size FROM chunks ORDER BY accessed ASC LIMIT ?1",
                )?;
                let rows = stmt.query_map([GC_BATCH], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            if batch.is_empty() {
                // accounting drifted from the table; the table wins
                self.size = 0;
                break;
            }

            let tx = self.conn.transaction()?;
            for (address, size) in batch {
                if self.size <= target {
                    break;
                }
                tx.execute("DELETE FROM chunks WHERE address = ?1", [&address])?;
                self.size = self.size.saturating_sub(size as u64);
                evicted += 1;
            }
            tx.commit()?;
        }
        Ok(evicted)
    }

    fn collect_if_over(&mut self) -> Result<()> {
        if self.size > self.capacity {
            let before = self.size;
            let target = self.low_water();
            let evicted = self.collect(target)?;
            info!(
                evicted,
                before,
                after = self.size,
                capacity = self.capacity,
                "garbage collected chunk database"
            );
        }
        Ok(())
    }
}

impl Drop for DbState {
    fn drop(&mut self) {
        if let Err(err) = self.flush_touches() {
            warn!(error = %err, "dropping queued chunk recency updates");
        }
    }
}

struct DbInner {
    path: PathBuf,
    state: Mutex<DbState>,
}

/// Persistent chunk store with byte-capacity accounting.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct DbStore {
    inner: Arc<DbInner>,
}

impl DbStore {
    /// Open (or create) the database at `path` with a byte capacity.
    ///
    /// Usage is recounted from the table, and a database already over
    /// `capacity` is collected before returning.
    pub fn open(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;

        let (size, clock): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(size), 0), COALESCE(MAX(accessed), 0) FROM chunks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut state = DbState {
            conn,
            size: size as u64,
            capacity,
            clock: clock as u64,
            touched: Vec::new(),
        };
        state.collect_if_over()?;
        info!(path = %path.display(), size = state.size, capacity, "opened chunk database");

        Ok(Self {
            inner: Arc::new(DbInner {
                path: path.to_path_buf(),
                state: Mutex::new(state),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, DbState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| StoreError::Worker("chunk database mutex poisoned".into()))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Persist a chunk. An address already present only has its recency refreshed.
    pub fn insert(&self, chunk: &Chunk) -> Result<()> {
        let mut state = self.lock()?;
        let clock = state.next_clock();
        let size = chunk.len() as i64;
        let inserted = state.conn.execute(
            "INSERT OR IGNORE INTO chunks (address, data, size, accessed) VALUES (?1, ?2, ?3, ?4)",
            params![chunk.address().as_bytes().as_slice(), &chunk.data()[..], size, clock],
        )?;

        if inserted == 0 {
            state.conn.execute(
                "UPDATE chunks SET accessed = MAX(accessed, ?2) WHERE address = ?1",
                params![chunk.address().as_bytes().as_slice(), clock],
            )?;
            return Ok(());
        }

        state.size += size as u64;
        state.collect_if_over()
    }

    /// Fetch and verify a chunk.
    ///
    /// A row whose bytes no longer hash to its address is deleted and
    /// reported as [`StoreError::InvalidChunk`].
    pub fn fetch(&self, address: &Address) -> Result<Option<Chunk>> {
        let mut state = self.lock()?;
        let data: Option<Vec<u8>> = state
            .conn
            .query_row(
                "SELECT data FROM chunks WHERE address = ?1",
                [address.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(data) = data else {
            return Ok(None);
        };

        let chunk = Chunk::with_address(*address, data);
        if !chunk.verify() {
            warn!(address = %address, "stored chunk failed verification, deleting");
            state.delete(address)?;
            return Err(StoreError::InvalidChunk(*address));
        }

        state.touch(*address)?;
        Ok(Some(chunk))
    }

    pub fn contains(&self, address: &Address) -> Result<bool> {
        let state = self.lock()?;
        let found: Option<i64> = state
            .conn
            .query_row(
                "SELECT 1 FROM chunks WHERE address = ?1",
                [address.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Delete one chunk. Returns whether it was present.
    pub fn remove(&self, address: &Address) -> Result<bool> {
        self.lock()?.delete(address)
    }

    /// Change the byte capacity, collecting if usage now exceeds it.
    /// Returns the number of chunks evicted. Zero empties the store.
    pub fn set_capacity(&self, capacity: u64) -> Result<usize> {
        let mut state = self.lock()?;
        state.capacity = capacity;
        let evicted = if state.size > capacity {
            let target = state.low_water();
            state.collect(target)?
        } else {
            0
        };
        info!(capacity, evicted, size = state.size, "chunk database capacity changed");
        Ok(evicted)
    }

    pub fn capacity(&self) -> Result<u64> {
        Ok(self.lock()?.capacity)
    }

    /// Bytes of chunk data currently stored.
    pub fn size_bytes(&self) -> Result<u64> {
        Ok(self.lock()?.size)
    }

    /// Number of stored chunks.
    pub fn len(&self) -> Result<u64> {
        let state = self.lock()?;
        let count: i64 = state
            .conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl fmt::Debug for DbStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbStore").field("path", &self.inner.path).finish()
    }
}

#[async_trait]
impl ChunkStore for DbStore {
    async fn put(&self, chunk: Chunk) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.insert(&chunk)).await?
    }

    async fn get(&self, address: &Address) -> Result<Chunk> {
        let store = self.clone();
        let address = *address;
        let found = tokio::task::spawn_blocking(move || store.fetch(&address)).await??;
        found.ok_or_else(|| {
            debug!(address = %address.short(), "chunk not in database");
            StoreError::NotFound(address)
        })
    }

    async fn has(&self, address: &Address) -> Result<bool> {
        let store = self.clone();
        let address = *address;
        tokio::task::spawn_blocking(move || store.contains(&address)).await?
    }
}
