//! Block Cache
//!
//! Fixed-size block caching in front of slow byte-range origins.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         BlockCache (trait)                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  LruBlockCache                  │  PersistentBlockCache                  │
//! │  ┌────────────────────────┐     │  ┌──────────────────┐                  │
//! │  │ LruCache<BlockKey,..>  │     │  │ Memory tier (TTL)│                  │
//! │  │ bounded by max_blocks  │     │  └────────┬─────────┘                  │
//! │  └────────────────────────┘     │  ┌────────▼─────────┐  oldest-first    │
//! │                                 │  │ BlobStore        │  eviction under  │
//! │                                 │  │ (memory / fs)    │  a single guard  │
//! │                                 │  └──────────────────┘                  │
//! │              │                  │            │                           │
//! │              └──────────────────┴────────────┘                           │
//! │                         In-flight table                                  │
//! │                 (one origin fetch per BlockKey)                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Block size is fixed for the lifetime of a cache
//! - At most one origin fetch per key is in flight at any time
//! - Failed fetches are never cached
//! - A key's bytes never change once written; a mutated origin gets a new
//!   [`SourceIdentity`] and therefore new keys

mod inflight;
mod key;
mod lru_cache;
mod metrics;
mod persistent;
mod store;

pub use inflight::{Inflight, InflightPolicy, SharedFetch};
pub use key::{fnv1a_64, BlockAnchor, BlockKey, SourceIdentity};
pub use lru_cache::{LruBlockCache, LruCacheConfig, LruStats};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use persistent::{EvictionReport, PersistentBlockCache, PersistentCacheConfig, PersistentStats};
pub use store::{BlobStore, BlobStoreStats, BlockRecord, FsBlobStore, InMemoryBlobStore, RecordMeta};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::Result;

/// Default block size (64KB)
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// Unstarted origin fetch for one block
pub type BlockFetch = BoxFuture<'static, Result<Bytes>>;

// =============================================================================
// BlockCache Trait
// =============================================================================

/// Block-level cache shared by any number of backends
///
/// `fetch` futures are lazy: a cache only polls one when it actually needs the
/// block from the origin, and drops it otherwise.
#[async_trait]
pub trait BlockCache: Send + Sync {
    /// Block size in bytes, fixed for the cache lifetime
    fn block_size(&self) -> u64;

    /// Return the block for `key`, running `fetch` on a miss
    async fn get(&self, key: BlockKey, fetch: BlockFetch) -> Result<Bytes>;

    /// Like [`BlockCache::get`], recording the total source size alongside the
    /// block where the cache can persist it
    async fn get_sized(
        &self,
        key: BlockKey,
        fetch: BlockFetch,
        source_size: Option<u64>,
    ) -> Result<Bytes> {
        let _ = source_size;
        self.get(key, fetch).await
    }

    /// Start loading `key` without waiting; failures are swallowed
    fn prefetch(&self, key: BlockKey, fetch: BlockFetch) {
        self.prefetch_sized(key, fetch, None)
    }

    /// Sized variant of [`BlockCache::prefetch`]
    fn prefetch_sized(&self, key: BlockKey, fetch: BlockFetch, source_size: Option<u64>);

    /// Source size recorded with `key`, without touching the origin
    async fn size(&self, key: &BlockKey) -> Option<u64> {
        let _ = key;
        None
    }

    /// Drop every cached block and stop tracking in-flight fetches
    async fn clear(&self) -> Result<()>;
}
