//! In-memory LRU Block Cache
//!
//! Bounded by block count. Lookup, coalescing and registration of a new fetch
//! happen in one critical section, so a hit returns without suspending and two
//! concurrent misses for one key share a single origin fetch.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::inflight::{Inflight, InflightPolicy, SharedFetch};
use super::key::BlockKey;
use super::metrics::CacheMetrics;
use super::{BlockCache, BlockFetch, DEFAULT_BLOCK_SIZE};
use crate::error::{Error, Result};

/// LRU cache configuration
#[derive(Debug, Clone)]
pub struct LruCacheConfig {
    /// Block size in bytes
    pub block_size: u64,
    /// Maximum number of cached blocks
    pub max_blocks: usize,
    /// Handling of in-flight fetches on `clear()`
    pub inflight_policy: InflightPolicy,
}

impl Default for LruCacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_blocks: 1024, // 64MB at the default block size
            inflight_policy: InflightPolicy::default(),
        }
    }
}

/// LRU block cache statistics
#[derive(Debug, Clone)]
pub struct LruStats {
    pub block_size: u64,
    pub max_blocks: usize,
    pub entries: usize,
    pub inflight: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct LruState {
    blocks: LruCache<BlockKey, Bytes>,
    inflight: Inflight<BlockKey>,
}

struct LruInner {
    config: LruCacheConfig,
    state: Mutex<LruState>,
    metrics: CacheMetrics,
}

enum Lookup {
    Hit(Bytes),
    Pending(SharedFetch),
}

/// Bounded in-memory block cache with strict LRU eviction
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct LruBlockCache {
    inner: Arc<LruInner>,
}

impl LruBlockCache {
    /// Create a cache with `max_blocks` blocks of `block_size` bytes
    pub fn new(block_size: u64, max_blocks: usize) -> Result<Self> {
        Self::with_config(LruCacheConfig {
            block_size,
            max_blocks,
            ..Default::default()
        })
    }

    /// Create a cache with custom configuration
    pub fn with_config(config: LruCacheConfig) -> Result<Self> {
        if config.block_size == 0 {
            return Err(Error::Config("block_size must be positive".into()));
        }
        let capacity = NonZeroUsize::new(config.max_blocks)
            .ok_or_else(|| Error::Config("max_blocks must be positive".into()))?;

        Ok(Self {
            inner: Arc::new(LruInner {
                state: Mutex::new(LruState {
                    blocks: LruCache::new(capacity),
                    inflight: Inflight::new(),
                }),
                config,
                metrics: CacheMetrics::new(),
            }),
        })
    }

    /// Whether `key` is cached, without touching its LRU position
    pub fn contains(&self, key: &BlockKey) -> bool {
        self.inner.state.lock().blocks.contains(key)
    }

    /// Number of cached blocks
    pub fn len(&self) -> usize {
        self.inner.state.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters for this cache
    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Get cache statistics
    pub fn stats(&self) -> LruStats {
        let state = self.inner.state.lock();
        LruStats {
            block_size: self.inner.config.block_size,
            max_blocks: self.inner.config.max_blocks,
            entries: state.blocks.len(),
            inflight: state.inflight.len(),
            hits: self.inner.metrics.memory_hits(),
            misses: self.inner.metrics.misses(),
            evictions: self.inner.metrics.evictions(),
        }
    }

    fn lookup(&self, key: BlockKey, fetch: BlockFetch) -> Lookup {
        let mut state = self.inner.state.lock();

        if let Some(data) = state.blocks.get(&key) {
            self.inner.metrics.record_memory_hit();
            return Lookup::Hit(data.clone());
        }

        if let Some(pending) = state.inflight.join(&key) {
            self.inner.metrics.record_coalesced();
            debug!(%key, "joining in-flight block fetch");
            return Lookup::Pending(pending);
        }

        self.inner.metrics.record_miss();
        let inner = Arc::clone(&self.inner);
        let pending = state.inflight.register(key, move |id| {
            async move {
                let result = fetch.await;
                inner.finish(key, id, &result);
                result
            }
            .boxed()
        });
        // Driven independently of the callers so dropping them never stalls joiners
        tokio::spawn(pending.clone().map(drop));
        Lookup::Pending(pending)
    }
}

impl LruInner {
    fn finish(&self, key: BlockKey, id: u64, result: &Result<Bytes>) {
        let mut state = self.state.lock();
        let current = state.inflight.complete(&key, id);

        match result {
            Ok(data) if current => {
                if let Some((evicted, old)) = state.blocks.push(key, data.clone()) {
                    if evicted != key {
                        self.metrics.record_eviction(old.len() as u64);
                        debug!(%evicted, "evicted least recently used block");
                    }
                }
            }
            Ok(_) => debug!(%key, "discarding block from a fetch detached by clear"),
            Err(err) => {
                self.metrics.record_fetch_error();
                debug!(%key, error = %err, "block fetch failed");
            }
        }
    }
}

#[async_trait]
impl BlockCache for LruBlockCache {
    fn block_size(&self) -> u64 {
        self.inner.config.block_size
    }

    async fn get(&self, key: BlockKey, fetch: BlockFetch) -> Result<Bytes> {
        match self.lookup(key, fetch) {
            Lookup::Hit(data) => Ok(data),
            Lookup::Pending(pending) => pending.await,
        }
    }

    fn prefetch_sized(&self, key: BlockKey, fetch: BlockFetch, _source_size: Option<u64>) {
        // The spawned driver completes the fetch; failures are logged in `finish`
        let _ = self.lookup(key, fetch);
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        let entries = state.blocks.len();
        state.blocks.clear();
        let inflight = state.inflight.clear(self.inner.config.inflight_policy);
        info!(entries, inflight, policy = ?self.inner.config.inflight_policy, "cleared LRU block cache");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
