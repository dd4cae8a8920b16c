//! Byte-range Sources
//!
//! The origin side of the crate: anything that can serve `[offset, offset + size)`
//! of a fixed-length byte sequence.
//!
//! - [`HttpRangeSource`]: HTTP `Range` requests with validation and retry
//! - [`FileSource`]: local file
//! - [`MemorySource`]: in-memory buffer
//!
//! [`crate::CachedByteRangeBackend`] implements the same trait on top of any of
//! these, so decoders never need to know whether a cache is in between.

mod file;
mod http;
mod memory;
mod retry;

pub use file::FileSource;
pub use http::{parse_content_range, HttpRangeSource, HttpSourceConfig, RemoteMetadata};
pub use memory::MemorySource;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

// =============================================================================
// ByteRangeSource Trait
// =============================================================================

/// Random-access reader over a fixed-length byte sequence
#[async_trait]
pub trait ByteRangeSource: Send + Sync {
    /// Read exactly `size` bytes starting at `offset`
    async fn get_bytes(&self, offset: u64, size: u64) -> Result<Bytes>;

    /// Total length in bytes
    async fn count(&self) -> Result<u64>;

    /// Release resources held by the source
    async fn close(&self) -> Result<()>;

    /// Read the trailing `size` bytes; returns them with the total length
    ///
    /// A request longer than the source yields the whole source.
    async fn get_bytes_from_end(&self, size: u64) -> Result<(Bytes, u64)> {
        if size == 0 {
            return Err(Error::invalid_argument("size must be positive"));
        }
        let len = self.count().await?;
        let size = size.min(len);
        if size == 0 {
            return Ok((Bytes::new(), len));
        }
        let data = self.get_bytes(len - size, size).await?;
        Ok((data, len))
    }

    /// Unstarted prefetch work covering `[offset, offset + size)`
    ///
    /// Sources without a cache have nothing to warm.
    async fn collect_prefetch_tasks(&self, offset: u64, size: u64) -> Result<Vec<PrefetchTask>> {
        let _ = (offset, size);
        Ok(Vec::new())
    }
}

/// Validate a read request against a source of length `len`
pub fn check_range(offset: u64, size: u64, len: u64) -> Result<()> {
    if size == 0 {
        return Err(Error::invalid_argument("size must be positive"));
    }
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(()),
        _ => Err(Error::OutOfRange { offset, size, len }),
    }
}

// =============================================================================
// Prefetch Scheduling
// =============================================================================

/// One deferred unit of prefetch work
///
/// Nothing happens until [`PrefetchTask::run`] is awaited. Tasks never fail;
/// errors are logged by whoever built the task.
pub struct PrefetchTask {
    run: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

impl PrefetchTask {
    /// Wrap a deferred future factory
    pub fn new<F>(run: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self { run: Box::new(run) }
    }

    /// Start the task and wait for it
    pub async fn run(self) {
        (self.run)().await
    }
}

impl std::fmt::Debug for PrefetchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchTask").finish_non_exhaustive()
    }
}

/// Run `tasks` in batches of at most `limit`
///
/// The token is checked before each batch; once cancelled no further batch
/// starts and the call fails with [`Error::Cancelled`]. A batch already
/// running is allowed to finish.
pub async fn run_limited(
    tasks: Vec<PrefetchTask>,
    limit: usize,
    cancel: Option<&CancellationToken>,
) -> Result<()> {
    if limit == 0 {
        return Err(Error::invalid_argument("limit must be positive"));
    }

    let mut tasks = tasks.into_iter().peekable();
    while tasks.peek().is_some() {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(Error::Cancelled);
        }
        let batch: Vec<_> = tasks.by_ref().take(limit).map(PrefetchTask::run).collect();
        futures::future::join_all(batch).await;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
