//! Content-addressed chunk storage.
//!
//! Byte streams are split into 4 KiB chunks linked into a hash tree, stored
//! in a two-tier store (an LRU cache in front of a SQLite database), and
//! read back lazily from the root reference alone.
//!
//! - [`StreamStore`]: `store` a stream, `wait` for durability, `retrieve` a reader
//! - [`ChunkStore`]: the put/get capability every tier implements
//! - [`MemStore`], [`DbStore`], [`LocalStore`]: cache, durable store, and both combined
//! - [`Context`]: cancellation and deadlines
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chunkstore::{Context, LocalStore, StoreParams, StreamStore};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! // Reads CHUNKSTORE_DATA_DIR and friends
//! let params = StoreParams::from_env()?;
//! let streams = StreamStore::with_params(Arc::new(LocalStore::open(&params)?), &params);
//!
//! let file = tokio::fs::File::open("song.wav").await?;
//! let size = file.metadata().await?.len();
//!
//! let ctx = Context::new();
//! let (reference, completion) = streams.store(&ctx, file, size, false).await?;
//! completion.wait(&ctx).await?;
//! println!("Stored as: {reference}");
//!
//! let (reader, _encrypted) = streams.retrieve(&reference);
//! let mut head = [0u8; 44];
//! reader.read_at(&mut head, 0).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Encryption
//!
//! With `to_encrypt`, every chunk is sealed under a key derived from a
//! per-stream file key, and the returned [`Reference`] carries the root
//! chunk key (128 hex chars instead of 64). Anyone holding the reference can
//! read the stream; the bare address alone is not enough.

pub mod address;
pub mod api;
pub mod chunk;
pub mod chunker;
pub mod config;
pub mod context;
pub mod encryption;
pub mod error;
pub mod store;

pub use address::{Address, AddressError, Reference};
pub use api::StreamStore;
pub use chunk::{Chunk, CHUNK_SIZE, MAX_CHUNK_LEN};
pub use chunker::{LazyChunkReader, ReadOutcome, Splitter, StoreCompletion};
pub use config::StoreParams;
pub use context::Context;
pub use encryption::FileKey;
pub use error::{Result, StoreError};
pub use store::{ChunkStore, DbStore, LocalStore, MemStore};
