//! StreamStore: store and retrieve whole streams.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chunkstore::{Context, LocalStore, StoreParams, StreamStore};
//!
//! # async fn demo() -> chunkstore::Result<()> {
//! let params = StoreParams::from_env().expect("config");
//! let streams = StreamStore::with_params(Arc::new(LocalStore::open(&params)?), &params);
//!
//! let data = b"Hello, World!";
//! let ctx = Context::new();
//! let (reference, completion) = streams.store(&ctx, &data[..], data.len() as u64, true).await?;
//! completion.wait(&ctx).await?;
//!
//! let (reader, encrypted) = streams.retrieve(&reference);
//! assert!(encrypted);
//! assert_eq!(reader.read_to_end().await?, data);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tokio::io::AsyncRead;

use crate::address::Reference;
use crate::chunker::{LazyChunkReader, Splitter, StoreCompletion};
use crate::config::StoreParams;
use crate::context::Context;
use crate::encryption::FileKey;
use crate::error::Result;
use crate::store::ChunkStore;

/// Stream-level front end over any [`ChunkStore`].
#[derive(Clone)]
pub struct StreamStore {
    store: Arc<dyn ChunkStore>,
    splitter: Splitter,
    max_fetches: usize,
}

impl StreamStore {
    /// Default concurrency limits.
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self::with_params(store, &StoreParams::default())
    }

    pub fn with_params(store: Arc<dyn ChunkStore>, params: &StoreParams) -> Self {
        Self {
            splitter: Splitter::new(store.clone(), params),
            store,
            max_fetches: params.max_in_flight(),
        }
    }

    pub fn chunk_store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Split `size` bytes of `reader` into a tree and start storing it.
    ///
    /// Returns as soon as the root reference is known; the tree is durable
    /// once the completion's `wait` succeeds. With `to_encrypt` a fresh key
    /// is generated and carried inside the returned [`Reference`].
    pub async fn store<R>(
        &self,
        ctx: &Context,
        reader: R,
        size: u64,
        to_encrypt: bool,
    ) -> Result<(Reference, StoreCompletion)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let key = to_encrypt.then(FileKey::generate);
        self.splitter.split(ctx, reader, size, key).await
    }

    /// Like [`StreamStore::store`] with encryption under a caller-held key.
    /// The same content under the same key always yields the same reference.
    pub async fn store_with_key<R>(
        &self,
        ctx: &Context,
        reader: R,
        size: u64,
        key: FileKey,
    ) -> Result<(Reference, StoreCompletion)>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.splitter.split(ctx, reader, size, Some(key)).await
    }

    /// Lazy reader over a stored tree, and whether the tree is encrypted.
    /// Never fails here; missing or undecryptable chunks surface on read.
    pub fn retrieve(&self, reference: &Reference) -> (LazyChunkReader, bool) {
        self.retrieve_with_context(reference, Context::new())
    }

    /// [`StreamStore::retrieve`] with every fetch bounded by `ctx`.
    pub fn retrieve_with_context(
        &self,
        reference: &Reference,
        ctx: Context,
    ) -> (LazyChunkReader, bool) {
        let reader = LazyChunkReader::with_context(
            self.store.clone(),
            reference.clone(),
            ctx,
            self.max_fetches,
        );
        (reader, reference.is_encrypted())
    }
}
