//! Cached Byte-range Backend
//!
//! Wraps any [`ByteRangeSource`] with any [`BlockCache`] and presents the same
//! source contract, so a decoder reads through the cache without knowing it.
//!
//! # Read Path
//!
//! ```text
//!   get_bytes(offset, size)
//!          │
//!          ▼
//!   block span [lo, hi] ── lo == hi ──► cache.get(block) ──► zero-copy slice
//!          │
//!          ▼ (multi-block)
//!   cache.get(lo..=hi) in parallel ──► copy each overlap into one buffer
//! ```
//!
//! Only whole blocks are ever requested from the origin, so the cost of
//! alignment is under one block of over-fetch at each end of a read.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, FutureExt, StreamExt};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{BlockAnchor, BlockCache, BlockFetch, BlockKey, SourceIdentity};
use crate::error::{Error, Result};
use crate::source::{check_range, ByteRangeSource, PrefetchTask};

/// Backend tuning
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Cap on concurrent block lookups within one read; unbounded when `None`
    pub max_parallel_blocks: Option<usize>,
}

/// Block-cached view of a byte source
pub struct CachedByteRangeBackend {
    source: Arc<dyn ByteRangeSource>,
    cache: Arc<dyn BlockCache>,
    identity: SourceIdentity,
    anchor: BlockAnchor,
    options: BackendOptions,
    count: OnceCell<u64>,
}

impl CachedByteRangeBackend {
    /// Create a backend keyed by `identity` with blocks counted from `anchor`
    pub fn new(
        source: Arc<dyn ByteRangeSource>,
        cache: Arc<dyn BlockCache>,
        identity: SourceIdentity,
        anchor: BlockAnchor,
    ) -> Self {
        Self {
            source,
            cache,
            identity,
            anchor,
            options: BackendOptions::default(),
            count: OnceCell::new(),
        }
    }

    /// Blocks counted from the start of the source
    pub fn from_start(
        source: Arc<dyn ByteRangeSource>,
        cache: Arc<dyn BlockCache>,
        identity: SourceIdentity,
    ) -> Self {
        Self::new(source, cache, identity, BlockAnchor::Start)
    }

    /// Blocks counted from the end of the source
    ///
    /// The trailing block keeps its key when the source grows.
    pub fn from_end(
        source: Arc<dyn ByteRangeSource>,
        cache: Arc<dyn BlockCache>,
        identity: SourceIdentity,
    ) -> Self {
        Self::new(source, cache, identity, BlockAnchor::End)
    }

    pub fn with_options(mut self, options: BackendOptions) -> Self {
        self.options = options;
        self
    }

    pub fn identity(&self) -> SourceIdentity {
        self.identity
    }

    pub fn anchor(&self) -> BlockAnchor {
        self.anchor
    }

    /// Shared cache behind this backend
    pub fn cache(&self) -> &Arc<dyn BlockCache> {
        &self.cache
    }

    fn block_key(&self, index: u64) -> BlockKey {
        self.identity.block(self.anchor, index)
    }

    fn block_fetch(&self, start: u64, end: u64) -> BlockFetch {
        let source = Arc::clone(&self.source);
        async move { source.get_bytes(start, end - start).await }.boxed()
    }

    async fn len(&self) -> Result<u64> {
        self.count
            .get_or_try_init(|| async {
                if let Some(size) = self.cache.size(&self.block_key(0)).await {
                    debug!(identity = %self.identity, size, "source size from cache");
                    return Ok(size);
                }
                self.source.count().await
            })
            .await
            .copied()
    }

    /// Read `[offset, offset + size)`, giving up once `cancel` fires
    pub async fn get_bytes_cancellable(
        &self,
        offset: u64,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        self.read(offset, size, Some(cancel)).await
    }

    /// Start loading every block of `[offset, offset + size)` without waiting
    pub async fn prefetch(&self, offset: u64, size: u64) -> Result<()> {
        let len = self.len().await?;
        check_range(offset, size, len)?;

        let block_size = self.cache.block_size();
        let (lo, hi) = self.anchor.index_span(offset, size, len, block_size);
        for index in lo..=hi {
            let (start, end) = self.anchor.block_range(index, len, block_size);
            self.cache
                .prefetch_sized(self.block_key(index), self.block_fetch(start, end), Some(len));
        }
        Ok(())
    }

    async fn read(&self, offset: u64, size: u64, cancel: Option<&CancellationToken>) -> Result<Bytes> {
        if size == 0 {
            return Err(Error::invalid_argument("size must be positive"));
        }
        let len = until_cancelled(cancel, self.len()).await?;
        check_range(offset, size, len)?;

        let block_size = self.cache.block_size();
        let (lo, hi) = self.anchor.index_span(offset, size, len, block_size);

        if lo == hi {
            let (start, end) = self.anchor.block_range(lo, len, block_size);
            let lookup = self.cache.get_sized(
                self.block_key(lo),
                self.block_fetch(start, end),
                Some(len),
            );
            let block = until_cancelled(cancel, lookup).await?;
            check_block(&block, start, end)?;

            let from = (offset - start) as usize;
            return Ok(block.slice(from..from + size as usize));
        }

        let span = (hi - lo + 1) as usize;
        let parallel = self.options.max_parallel_blocks.unwrap_or(span).max(1);
        let mut blocks = stream::iter(lo..=hi)
            .map(|index| {
                let (start, end) = self.anchor.block_range(index, len, block_size);
                let lookup = self.cache.get_sized(
                    self.block_key(index),
                    self.block_fetch(start, end),
                    Some(len),
                );
                async move { lookup.await.map(|block| (start, end, block)) }
            })
            .buffer_unordered(parallel);

        let read_end = offset + size;
        let mut out = BytesMut::zeroed(size as usize);
        loop {
            // Dropping `blocks` on cancellation stops any further lookups
            let next = match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    next = blocks.next() => next,
                },
                None => blocks.next().await,
            };
            let Some(result) = next else {
                break;
            };

            let (start, end, block) = result?;
            check_block(&block, start, end)?;

            let copy_start = start.max(offset);
            let copy_end = end.min(read_end);
            out[(copy_start - offset) as usize..(copy_end - offset) as usize]
                .copy_from_slice(&block[(copy_start - start) as usize..(copy_end - start) as usize]);
        }

        Ok(out.freeze())
    }
}

async fn until_cancelled<T>(
    cancel: Option<&CancellationToken>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        },
        None => fut.await,
    }
}

fn check_block(block: &Bytes, start: u64, end: u64) -> Result<()> {
    if block.len() as u64 != end - start {
        return Err(Error::Integrity {
            expected: end - start,
            actual: block.len() as u64,
        });
    }
    Ok(())
}

#[async_trait]
impl ByteRangeSource for CachedByteRangeBackend {
    async fn get_bytes(&self, offset: u64, size: u64) -> Result<Bytes> {
        self.read(offset, size, None).await
    }

    async fn count(&self) -> Result<u64> {
        self.len().await
    }

    /// Closes the origin; the shared cache is left alone
    async fn close(&self) -> Result<()> {
        self.source.close().await
    }

    async fn get_bytes_from_end(&self, size: u64) -> Result<(Bytes, u64)> {
        if size == 0 {
            return Err(Error::invalid_argument("size must be positive"));
        }
        let len = self.len().await?;
        let size = size.min(len);
        if size == 0 {
            return Ok((Bytes::new(), len));
        }
        Ok((self.read(len - size, size, None).await?, len))
    }

    async fn collect_prefetch_tasks(&self, offset: u64, size: u64) -> Result<Vec<PrefetchTask>> {
        let len = self.len().await?;
        check_range(offset, size, len)?;

        let block_size = self.cache.block_size();
        let (lo, hi) = self.anchor.index_span(offset, size, len, block_size);
        let tasks = (lo..=hi)
            .map(|index| {
                let (start, end) = self.anchor.block_range(index, len, block_size);
                let key = self.block_key(index);
                let fetch = self.block_fetch(start, end);
                let cache = Arc::clone(&self.cache);
                PrefetchTask::new(move || {
                    async move {
                        if let Err(err) = cache.get_sized(key, fetch, Some(len)).await {
                            debug!(%key, error = %err, "prefetch failed");
                        }
                    }
                    .boxed()
                })
            })
            .collect();
        Ok(tasks)
    }
}

// =============================================================================
// Tests
// =============================================================================
