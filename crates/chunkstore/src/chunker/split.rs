//! Splitter: stream → hash tree.
//!
//! The input is read in batches of one level-one subtree (`branches` leaves).
//! Each batch is sealed by its own task, up to `split_workers` at a time, and
//! the resulting subtree roots are fed in stream order into a [`TreeBuilder`]
//! that assembles the upper levels.
//!
//! Every sealed chunk is handed to a put task. Puts run in the background,
//! bounded by `max_in_flight` permits, so the root reference is known as soon
//! as the last byte is hashed. [`StoreCompletion::wait`] resolves once every
//! put has finished.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::{branches, seal};
use crate::address::Reference;
use crate::chunk::{Chunk, CHUNK_SIZE};
use crate::config::StoreParams;
use crate::context::Context;
use crate::encryption::FileKey;
use crate::error::{Result, StoreError};
use crate::store::ChunkStore;

/// A sealed subtree root and the stream bytes beneath it.
#[derive(Debug, Clone)]
struct Child {
    reference: Reference,
    span: u64,
}

/// State shared by one split and its put tasks.
struct Pipeline {
    store: Arc<dyn ChunkStore>,
    key: Option<FileKey>,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    abort: Context,
    failure: Mutex<Option<StoreError>>,
    chunks: AtomicU64,
}

impl Pipeline {
    /// Record the first put failure and stop the rest.
    fn fail(&self, err: StoreError) {
        let mut slot = self.failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            warn!(error = %err, "chunk put failed, abandoning remaining puts");
            *slot = Some(err);
        }
        drop(slot);
        self.abort.cancel();
    }

    fn take_failure(&self) -> Option<StoreError> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Queue a put, waiting for a permit. After a failure or cancellation
    /// chunks are still sealed (the root must be computed) but no longer stored.
    async fn submit(self: &Arc<Self>, chunk: Chunk) {
        if let Some(err) = self.abort.err() {
            self.fail(err);
            return;
        }
        let permit = tokio::select! {
            biased;
            err = self.abort.done() => {
                self.fail(err);
                return;
            }
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let pipeline = self.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            if let Err(err) = pipeline.abort.run(pipeline.store.put(chunk)).await {
                pipeline.fail(err);
            }
        });
    }

    /// Seal one node and queue it for storage.
    async fn emit(self: &Arc<Self>, span: u64, payload: &[u8]) -> Result<Child> {
        let (chunk, reference) = seal(span, payload, self.key.as_ref())?;
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.submit(chunk).await;
        Ok(Child { reference, span })
    }

    async fn emit_node(self: &Arc<Self>, children: &[Child]) -> Result<Child> {
        let width = Reference::encoded_len(self.key.is_some());
        let mut payload = Vec::with_capacity(children.len() * width);
        let mut span = 0u64;
        for child in children {
            child.reference.write_to(&mut payload);
            span += child.span;
        }
        self.emit(span, &payload).await
    }
}

/// Bottom-up assembly of internal nodes.
///
/// `levels[0]` receives pushed children; a level that fills up to `branches`
/// entries is sealed into one node on the level above.
struct TreeBuilder {
    pipeline: Arc<Pipeline>,
    branches: usize,
    levels: Vec<Vec<Child>>,
}

impl TreeBuilder {
    fn new(pipeline: Arc<Pipeline>) -> Self {
        let branches = branches(pipeline.key.is_some());
        Self {
            pipeline,
            branches,
            levels: Vec::new(),
        }
    }

    async fn push(&mut self, child: Child) -> Result<()> {
        self.push_at(0, child).await
    }

    async fn push_at(&mut self, mut level: usize, mut child: Child) -> Result<()> {
        loop {
            if self.levels.len() <= level {
                self.levels.push(Vec::new());
            }
            self.levels[level].push(child);
            if self.levels[level].len() < self.branches {
                return Ok(());
            }
            let group = std::mem::take(&mut self.levels[level]);
            child = self.pipeline.emit_node(&group).await?;
            level += 1;
        }
    }

    /// Seal the partial groups left on each level and return the root.
    async fn finish(mut self) -> Result<Child> {
        let mut level = 0;
        while level < self.levels.len() {
            let entries = std::mem::take(&mut self.levels[level]);
            let above = self.levels[level + 1..].iter().any(|l| !l.is_empty());
            let child = match entries.len() {
                0 => {
                    level += 1;
                    continue;
                }
                // a lone child is promoted, never wrapped
                1 => entries.into_iter().next(),
                _ => Some(self.pipeline.emit_node(&entries).await?),
            };
            let Some(child) = child else { break };
            if !above {
                return Ok(child);
            }
            self.push_at(level + 1, child).await?;
            level += 1;
        }
        Err(StoreError::Worker("tree builder finished without a root".into()))
    }
}

/// Seal the leaves of one batch and return its subtree root.
async fn build_subtree(pipeline: Arc<Pipeline>, batch: Bytes) -> Result<Child> {
    let mut builder = TreeBuilder::new(pipeline.clone());
    for leaf in batch.chunks(CHUNK_SIZE) {
        let child = pipeline.emit(leaf.len() as u64, leaf).await?;
        builder.push(child).await?;
    }
    builder.finish().await
}

/// Fill `buf` from `reader`, stopping early only at end of input.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Resolves once every chunk of a split has been stored (or one put failed).
///
/// Dropping it without waiting leaves the puts running in the background.
#[must_use = "the tree is not durable until wait() succeeds"]
pub struct StoreCompletion {
    pipeline: Arc<Pipeline>,
}

impl StoreCompletion {
    /// Chunks the tree consists of, leaves and internal nodes.
    pub fn chunk_count(&self) -> u64 {
        self.pipeline.chunks.load(Ordering::Relaxed)
    }

    /// Wait for all puts, bounded by `ctx`.
    ///
    /// When `ctx` finishes first the remaining puts are abandoned and its
    /// error is returned. Otherwise the first put failure, if any.
    pub async fn wait(self, ctx: &Context) -> Result<()> {
        let interrupted = tokio::select! {
            biased;
            _ = self.pipeline.tracker.wait() => None,
            err = ctx.done() => Some(err),
        };
        if let Some(err) = interrupted {
            self.pipeline.abort.cancel();
            return Err(err);
        }
        match self.pipeline.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for StoreCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCompletion")
            .field("chunks", &self.chunk_count())
            .field("pending", &self.pipeline.tracker.len())
            .finish()
    }
}

/// Builds hash trees over a chunk store.
#[derive(Clone)]
pub struct Splitter {
    store: Arc<dyn ChunkStore>,
    max_in_flight: usize,
    split_workers: usize,
}

impl Splitter {
    pub fn new(store: Arc<dyn ChunkStore>, params: &StoreParams) -> Self {
        Self {
            store,
            max_in_flight: params.max_in_flight(),
            split_workers: params.split_workers(),
        }
    }

    /// Split exactly `size` bytes of `reader` into a tree.
    ///
    /// Returns once the root is known. A reader that ends early fails with
    /// [`StoreError::UnexpectedEof`]; `ctx` finishing while the input is
    /// still being read fails with its error. Put failures surface only
    /// through the returned [`StoreCompletion`].
    pub async fn split<R>(
        &self,
        ctx: &Context,
        mut reader: R,
        size: u64,
        key: Option<FileKey>,
    ) -> Result<(Reference, StoreCompletion)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let pipeline = Arc::new(Pipeline {
            store: self.store.clone(),
            key,
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(self.max_in_flight)),
            abort: ctx.child(),
            failure: Mutex::new(None),
            chunks: AtomicU64::new(0),
        });

        let result = self.build(ctx, &pipeline, &mut reader, size).await;
        pipeline.tracker.close();

        match result {
            Ok(root) => {
                debug!(
                    size,
                    chunks = pipeline.chunks.load(Ordering::Relaxed),
                    encrypted = root.reference.is_encrypted(),
                    root = %root.reference.address().short(),
                    "split finished"
                );
                Ok((root.reference, StoreCompletion { pipeline }))
            }
            Err(err) => {
                pipeline.abort.cancel();
                Err(err)
            }
        }
    }

    async fn build<R>(
        &self,
        ctx: &Context,
        pipeline: &Arc<Pipeline>,
        reader: &mut R,
        size: u64,
    ) -> Result<Child>
    where
        R: AsyncRead + Unpin + Send,
    {
        if size == 0 {
            return pipeline.emit(0, &[]).await;
        }

        let batch_len = (branches(pipeline.key.is_some()) * CHUNK_SIZE) as u64;
        let mut top = TreeBuilder::new(pipeline.clone());
        let mut pending: VecDeque<JoinHandle<Result<Child>>> = VecDeque::new();
        let mut consumed = 0u64;

        let outcome: Result<()> = async {
            while consumed < size {
                if let Some(err) = ctx.err() {
                    return Err(err);
                }

                let want = batch_len.min(size - consumed) as usize;
                let mut buf = vec![0u8; want];
                let got = ctx.run(async { Ok(read_full(&mut *reader, &mut buf).await?) }).await?;
                consumed += got as u64;
                if got < want {
                    return Err(StoreError::UnexpectedEof {
                        read: consumed,
                        expected: size,
                    });
                }

                if pending.len() >= self.split_workers {
                    if let Some(handle) = pending.pop_front() {
                        top.push(handle.await??).await?;
                    }
                }
                pending.push_back(tokio::spawn(build_subtree(pipeline.clone(), Bytes::from(buf))));
            }

            while let Some(handle) = pending.pop_front() {
                top.push(handle.await??).await?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            for handle in pending {
                handle.abort();
            }
            return Err(err);
        }
        top.finish().await
    }
}
