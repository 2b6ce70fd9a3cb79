//! LazyChunkReader: random access over a stored hash tree.
//!
//! Nothing is fetched until the first read. Each read walks from the root to
//! the leaves covering the requested window, fetching sibling subtrees
//! concurrently. Only the root node is kept between reads; everything else
//! comes from the store (and so from its cache tier).

use futures::future::{try_join_all, BoxFuture};
use std::sync::Arc;
use tokio::sync::{OnceCell, Semaphore};

use super::{branches, child_unit, is_leaf, open, Node};
use crate::address::Reference;
use crate::config::DEFAULT_MAX_IN_FLIGHT;
use crate::context::Context;
use crate::error::{Result, StoreError};
use crate::store::ChunkStore;

/// Result of one [`LazyChunkReader::read_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes written to the front of the buffer.
    pub read: usize,
    /// The read reached the end of the stream.
    pub eof: bool,
}

pub struct LazyChunkReader {
    store: Arc<dyn ChunkStore>,
    root: Reference,
    ctx: Context,
    fetches: Semaphore,
    root_node: OnceCell<Node>,
}

impl LazyChunkReader {
    pub fn new(store: Arc<dyn ChunkStore>, root: Reference) -> Self {
        Self::with_context(store, root, Context::new(), DEFAULT_MAX_IN_FLIGHT)
    }

    /// A reader whose fetches honour `ctx`, with at most `max_fetches` in flight.
    pub fn with_context(
        store: Arc<dyn ChunkStore>,
        root: Reference,
        ctx: Context,
        max_fetches: usize,
    ) -> Self {
        Self {
            store,
            root,
            ctx,
            fetches: Semaphore::new(max_fetches.max(1)),
            root_node: OnceCell::new(),
        }
    }

    pub fn reference(&self) -> &Reference {
        &self.root
    }

    pub fn is_encrypted(&self) -> bool {
        self.root.is_encrypted()
    }

    /// Total stream length. Fetches the root on first use.
    pub async fn size(&self) -> Result<u64> {
        Ok(self.root().await?.span)
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// `eof` is set once the window reaches the end of the stream, so reading
    /// the whole stream into an exactly sized buffer returns every byte with
    /// `eof` set. A missing chunk fails the read; nothing partial is returned.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        let root = self.root().await?;
        let span = root.span;
        if offset >= span {
            return Ok(ReadOutcome { read: 0, eof: true });
        }

        let len = (span - offset).min(buf.len() as u64) as usize;
        self.read_node(root.clone(), offset, &mut buf[..len]).await?;
        Ok(ReadOutcome {
            read: len,
            eof: offset + len as u64 >= span,
        })
    }

    /// Read the whole stream into memory.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let size = self.size().await?;
        let len = usize::try_from(size).map_err(|_| {
            StoreError::Worker(format!("stream of {size} bytes does not fit in memory"))
        })?;
        let mut buf = vec![0u8; len];
        self.read_at(&mut buf, 0).await?;
        Ok(buf)
    }

    async fn root(&self) -> Result<&Node> {
        self.root_node
            .get_or_try_init(|| self.fetch(&self.root))
            .await
    }

    async fn fetch(&self, reference: &Reference) -> Result<Node> {
        let chunk = {
            let _permit = self
                .fetches
                .acquire()
                .await
                .map_err(|_| StoreError::Worker("reader fetch semaphore closed".into()))?;
            self.ctx.run(self.store.get(reference.address())).await?
        };
        open(reference, &chunk)
    }

    /// Fill `dst` with the node's bytes starting at `offset` within the node.
    fn read_node<'a>(
        &'a self,
        node: Node,
        offset: u64,
        dst: &'a mut [u8],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if dst.is_empty() {
                return Ok(());
            }

            if is_leaf(node.span) {
                if node.payload.len() as u64 != node.span {
                    return Err(StoreError::corrupt(
                        node.address,
                        format!("leaf holds {} bytes but spans {}", node.payload.len(), node.span),
                    ));
                }
                let start = offset as usize;
                dst.copy_from_slice(&node.payload[start..start + dst.len()]);
                return Ok(());
            }

            let encrypted = self.root.is_encrypted();
            let width = Reference::encoded_len(encrypted);
            let unit = child_unit(node.span, branches(encrypted));
            let count = node.span.div_ceil(unit) as usize;
            if node.payload.len() != count * width {
                return Err(StoreError::corrupt(
                    node.address,
                    format!(
                        "node holds {} bytes, expected {} references",
                        node.payload.len(),
                        count
                    ),
                ));
            }

            let end = offset + dst.len() as u64;
            let first = (offset / unit) as usize;
            let last = ((end - 1) / unit) as usize;

            let mut rest = dst;
            let mut reads = Vec::with_capacity(last - first + 1);
            for index in first..=last {
                let child_start = index as u64 * unit;
                let child_span = unit.min(node.span - child_start);
                let from = offset.max(child_start) - child_start;
                let to = end.min(child_start + child_span) - child_start;

                let (window, tail) = std::mem::take(&mut rest).split_at_mut((to - from) as usize);
                rest = tail;

                let bytes = &node.payload[index * width..(index + 1) * width];
                let child = Reference::from_slice(bytes).map_err(|e| {
                    StoreError::corrupt(node.address, format!("bad child reference: {e}"))
                })?;

                reads.push(async move {
                    let child_node = self.fetch(&child).await?;
                    if child_node.span != child_span {
                        return Err(StoreError::corrupt(
                            child_node.address,
                            format!(
                                "spans {} bytes, parent expects {}",
                                child_node.span, child_span
                            ),
                        ));
                    }
                    self.read_node(child_node, from, window).await
                });
            }

            try_join_all(reads).await?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for LazyChunkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyChunkReader")
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::chunk::{Chunk, CHUNK_SIZE};
    use crate::chunker::Splitter;
    use crate::config::StoreParams;
    use crate::encryption::FileKey;
    use crate::store::MemStore;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    async fn stored(data: &[u8], key: Option<FileKey>) -> Result<(Arc<MemStore>, Reference)> {
        let store = Arc::new(MemStore::new(10_000));
        let splitter = Splitter::new(store.clone(), &StoreParams::with_data_dir("/unused"));
        let ctx = Context::new();
        let (root, completion) = splitter.split(&ctx, data, data.len() as u64, key).await?;
        completion.wait(&ctx).await?;
        Ok((store, root))
    }

    #[tokio::test]
    async fn test_read_whole_stream() -> Result<()> {
        let data = payload(CHUNK_SIZE * 130 + 5);
        let (store, root) = stored(&data, None).await?;
        let reader = LazyChunkReader::new(store, root);

        let mut buf = vec![0u8; data.len()];
        let outcome = reader.read_at(&mut buf, 0).await?;
        assert_eq!(outcome, ReadOutcome { read: data.len(), eof: true });
        assert_eq!(buf, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_windows_across_boundaries() -> Result<()> {
        let data = payload(CHUNK_SIZE * 200 + 123);
        let (store, root) = stored(&data, Some(FileKey::generate())).await?;
        let reader = LazyChunkReader::new(store, root);

        let windows = [
            (0, 1),
            (4095, 2),
            (CHUNK_SIZE * 64 - 3, 10),
            (CHUNK_SIZE * 150, CHUNK_SIZE * 3),
            (data.len() - 7, 7),
        ];
        for (offset, len) in windows {
            let mut buf = vec![0u8; len];
            let outcome = reader.read_at(&mut buf, offset as u64).await?;
            assert_eq!(outcome.read, len);
            assert_eq!(&buf[..], &data[offset..offset + len], "offset {offset}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_read_past_end() -> Result<()> {
        let data = payload(1000);
        let (store, root) = stored(&data, None).await?;
        let reader = LazyChunkReader::new(store, root);

        let mut buf = vec![0u8; 100];
        let outcome = reader.read_at(&mut buf, 950).await?;
        assert_eq!(outcome, ReadOutcome { read: 50, eof: true });
        assert_eq!(&buf[..50], &data[950..]);

        let outcome = reader.read_at(&mut buf, 5000).await?;
        assert_eq!(outcome, ReadOutcome { read: 0, eof: true });
        Ok(())
    }

    #[tokio::test]
    async fn test_size_and_read_to_end() -> Result<()> {
        let data = payload(CHUNK_SIZE * 3);
        let (store, root) = stored(&data, None).await?;
        let reader = LazyChunkReader::new(store, root);
        assert_eq!(reader.size().await?, data.len() as u64);
        assert_eq!(reader.read_to_end().await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_stream() -> Result<()> {
        let (store, root) = stored(&[], None).await?;
        let reader = LazyChunkReader::new(store, root);
        assert_eq!(reader.size().await?, 0);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read_at(&mut buf, 0).await?, ReadOutcome { read: 0, eof: true });
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_leaf_fails_read() -> Result<()> {
        let data = payload(CHUNK_SIZE * 4);
        let (store, root) = stored(&data, None).await?;

        // drop everything but the root
        let root_chunk = store.get(root.address()).await?;
        store.clear();
        store.insert(root_chunk);

        let reader = LazyChunkReader::new(store, root);
        let mut buf = vec![0u8; data.len()];
        let err = reader.read_at(&mut buf, 0).await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_key_fails_cleanly() -> Result<()> {
        let data = payload(CHUNK_SIZE * 2);
        let (store, root) = stored(&data, Some(FileKey::generate())).await?;
        let forged = Reference::Encrypted {
            address: *root.address(),
            key: FileKey::generate().derive_chunk_key(b"anything")?,
        };

        let reader = LazyChunkReader::new(store, forged);
        let err = reader.size().await.unwrap_err();
        assert!(matches!(err, StoreError::Decryption(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_inconsistent_span_is_corrupt() -> Result<()> {
        let store = Arc::new(MemStore::new(100));
        // a leaf claiming more bytes than it carries
        let leaf = Chunk::new(crate::chunk::frame(10, b"abc"));
        let address: Address = *leaf.address();
        store.insert(leaf);

        let reader = LazyChunkReader::new(store, Reference::Plain(address));
        let mut buf = [0u8; 10];
        let err = reader.read_at(&mut buf, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptTree { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_reader_fails() -> Result<()> {
        let data = payload(100);
        let (store, root) = stored(&data, None).await?;
        let ctx = Context::new();
        ctx.cancel();
        let reader = LazyChunkReader::with_context(store, root, ctx, 4);
        let err = reader.size().await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        Ok(())
    }
}
