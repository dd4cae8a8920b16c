//! Two-tier Persistent Block Cache
//!
//! A short-lived memory tier in front of a size-budgeted [`BlobStore`].
//!
//! # Design
//!
//! - Memory entries expire `memory_ttl` after their last touch; expiry is
//!   checked lazily on access and swept on insert, never by per-key timers
//! - Origin fetches are bounded by a fair semaphore: a released permit goes to
//!   the longest-waiting fetch
//! - The store is trimmed oldest-first down to `max_bytes * (1 - eviction_fraction)`
//!   once it grows past `max_bytes`; passes run one at a time and each
//!   rescans the store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::inflight::{Inflight, InflightPolicy, SharedFetch};
use super::key::BlockKey;
use super::metrics::{CacheMetrics, MetricsSnapshot};
use super::store::{BlobStore, BlockRecord, InMemoryBlobStore};
use super::{BlockCache, BlockFetch, DEFAULT_BLOCK_SIZE};
use crate::error::{Error, Result};

/// Persistent cache configuration
#[derive(Debug, Clone)]
pub struct PersistentCacheConfig {
    /// Block size in bytes
    pub block_size: u64,
    /// Memory tier lifetime after last access
    pub memory_ttl: Duration,
    /// Persistent tier budget in bytes
    pub max_bytes: u64,
    /// Share of `max_bytes` freed below the budget by each eviction pass
    pub eviction_fraction: f64,
    /// Maximum concurrent origin fetches
    pub max_concurrent_fetches: usize,
    /// Handling of in-flight fetches on `clear()`
    pub inflight_policy: InflightPolicy,
}

impl Default for PersistentCacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            memory_ttl: Duration::from_secs(1),
            max_bytes: 1024 * 1024 * 1024, // 1GB
            eviction_fraction: 0.1,
            max_concurrent_fetches: 10,
            inflight_policy: InflightPolicy::default(),
        }
    }
}

impl PersistentCacheConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be positive".into()));
        }
        if self.max_bytes == 0 {
            return Err(Error::Config("max_bytes must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.eviction_fraction) {
            return Err(Error::Config(format!(
                "eviction_fraction must be within [0, 1], got {}",
                self.eviction_fraction
            )));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(Error::Config(
                "max_concurrent_fetches must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Usage an eviction pass trims the store down to
    pub fn eviction_target(&self) -> u64 {
        (self.max_bytes as f64 * (1.0 - self.eviction_fraction)) as u64
    }
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Store usage before the pass
    pub scanned_bytes: u64,
    pub removed_entries: usize,
    pub removed_bytes: u64,
    /// Store usage after the pass
    pub remaining_bytes: u64,
}

/// Persistent cache statistics
#[derive(Debug, Clone)]
pub struct PersistentStats {
    pub persistent_entries: usize,
    pub persistent_bytes: u64,
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub inflight: usize,
    pub max_bytes: u64,
    pub block_size: u64,
    pub metrics: MetricsSnapshot,
}

struct MemoryEntry {
    data: Bytes,
    last_touched: Instant,
}

impl MemoryEntry {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.last_touched) < ttl
    }
}

struct TierState {
    memory: HashMap<String, MemoryEntry>,
    inflight: Inflight<String>,
}

struct PersistentInner {
    config: PersistentCacheConfig,
    store: Arc<dyn BlobStore>,
    state: Mutex<TierState>,
    fetch_slots: Semaphore,
    eviction_guard: tokio::sync::Mutex<()>,
    metrics: CacheMetrics,
}

enum Lookup {
    Hit(Bytes),
    Pending(SharedFetch),
}

/// Memory tier over a durable blob store
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct PersistentBlockCache {
    inner: Arc<PersistentInner>,
}

impl PersistentBlockCache {
    /// Create a cache over `store` with default configuration
    pub fn new(store: Arc<dyn BlobStore>) -> Result<Self> {
        Self::with_config(store, PersistentCacheConfig::default())
    }

    /// Create a cache over `store` with custom configuration
    pub fn with_config(store: Arc<dyn BlobStore>, config: PersistentCacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PersistentInner {
                fetch_slots: Semaphore::new(config.max_concurrent_fetches),
                config,
                store,
                state: Mutex::new(TierState {
                    memory: HashMap::new(),
                    inflight: Inflight::new(),
                }),
                eviction_guard: tokio::sync::Mutex::new(()),
                metrics: CacheMetrics::new(),
            }),
        })
    }

    /// Cache backed by an [`InMemoryBlobStore`]
    pub fn in_memory(config: PersistentCacheConfig) -> Result<Self> {
        Self::with_config(Arc::new(InMemoryBlobStore::new()), config)
    }

    pub fn config(&self) -> &PersistentCacheConfig {
        &self.inner.config
    }

    /// Underlying durable store
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.inner.store
    }

    /// Counters for this cache
    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Drop expired memory entries; returns how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let mut state = self.inner.state.lock();
        self.inner.sweep_locked(&mut state, Instant::now())
    }

    /// Trim the store if it is over budget
    ///
    /// Waits for any running pass, then scans the store itself.
    pub async fn evict_if_needed(&self) -> Result<EvictionReport> {
        self.inner.evict_if_needed().await
    }

    /// Get cache statistics; scans the store
    pub async fn stats(&self) -> Result<PersistentStats> {
        let records = self.inner.store.scan().await?;
        let persistent_bytes = records.iter().map(|(_, meta)| meta.content_length).sum();

        let state = self.inner.state.lock();
        Ok(PersistentStats {
            persistent_entries: records.len(),
            persistent_bytes,
            memory_entries: state.memory.len(),
            memory_bytes: state.memory.values().map(|e| e.data.len() as u64).sum(),
            inflight: state.inflight.len(),
            max_bytes: self.inner.config.max_bytes,
            block_size: self.inner.config.block_size,
            metrics: self.inner.metrics.snapshot(),
        })
    }

    fn lookup(&self, key: BlockKey, fetch: BlockFetch, source_size: Option<u64>) -> Lookup {
        let name = key.to_string();
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        let expired = match state.memory.get_mut(&name) {
            Some(entry) if entry.is_fresh(now, self.inner.config.memory_ttl) => {
                entry.last_touched = now;
                self.inner.metrics.record_memory_hit();
                return Lookup::Hit(entry.data.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.memory.remove(&name);
        }

        if let Some(pending) = state.inflight.join(&name) {
            self.inner.metrics.record_coalesced();
            debug!(%key, "joining in-flight block load");
            return Lookup::Pending(pending);
        }

        let inner = Arc::clone(&self.inner);
        let pending = state.inflight.register(name.clone(), move |id| {
            async move {
                let result = inner.load(&name, id, fetch, source_size).await;
                inner.finish(&name, id, &result);
                result
            }
            .boxed()
        });
        tokio::spawn(pending.clone().map(drop));
        Lookup::Pending(pending)
    }
}

impl PersistentInner {
    /// Store, then origin
    async fn load(
        self: &Arc<Self>,
        name: &str,
        id: u64,
        fetch: BlockFetch,
        source_size: Option<u64>,
    ) -> Result<Bytes> {
        match self.store.get(name).await {
            Ok(Some(record)) => {
                self.metrics.record_persistent_hit();
                debug!(name, "persistent tier hit");
                return Ok(record.data);
            }
            Ok(None) => {}
            Err(err) => warn!(name, error = %err, "persistent tier read failed"),
        }

        self.metrics.record_miss();
        let data = {
            let _permit = self
                .fetch_slots
                .acquire()
                .await
                .map_err(|_| Error::Cancelled)?;
            fetch.await?
        };

        // A fetch detached by clear() must not repopulate the store
        if !self.state.lock().inflight.is_current(&name.to_string(), id) {
            return Ok(data);
        }

        let record = BlockRecord::new(data.clone(), source_size);
        let stored = self.store.put(name, record).await;
        let current = self.state.lock().inflight.is_current(&name.to_string(), id);
        match stored {
            Ok(()) if !current => {
                // clear() ran while the record was being written
                if let Err(err) = self.store.delete(name).await {
                    warn!(name, error = %err, "failed to drop block persisted after clear");
                }
            }
            Ok(()) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = inner.evict_if_needed().await {
                        warn!(error = %err, "eviction pass failed");
                    }
                });
            }
            Err(err) => warn!(name, error = %err, "failed to persist block"),
        }
        Ok(data)
    }

    fn finish(&self, name: &str, id: u64, result: &Result<Bytes>) {
        let mut state = self.state.lock();
        let current = state.inflight.complete(&name.to_string(), id);

        match result {
            Ok(data) if current => {
                let now = Instant::now();
                self.sweep_locked(&mut state, now);
                state.memory.insert(
                    name.to_string(),
                    MemoryEntry {
                        data: data.clone(),
                        last_touched: now,
                    },
                );
            }
            Ok(_) => {}
            Err(err) => {
                self.metrics.record_fetch_error();
                debug!(name, error = %err, "block load failed");
            }
        }
    }

    fn sweep_locked(&self, state: &mut TierState, now: Instant) -> usize {
        let ttl = self.config.memory_ttl;
        let before = state.memory.len();
        state.memory.retain(|_, entry| entry.is_fresh(now, ttl));
        before - state.memory.len()
    }

    async fn evict_if_needed(&self) -> Result<EvictionReport> {
        // Passes are serialized; each one scans after taking the guard, so
        // writes that landed during an earlier pass are always counted
        let _guard = self.eviction_guard.lock().await;

        let mut records = self.store.scan().await?;
        let total: u64 = records.iter().map(|(_, meta)| meta.content_length).sum();
        if total <= self.config.max_bytes {
            return Ok(EvictionReport {
                scanned_bytes: total,
                remaining_bytes: total,
                ..Default::default()
            });
        }

        let target = self.config.eviction_target();
        records.sort_by(|(a_name, a), (b_name, b)| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a_name.cmp(b_name))
        });

        let mut report = EvictionReport {
            scanned_bytes: total,
            remaining_bytes: total,
            ..Default::default()
        };
        let mut evicted = Vec::new();
        for (name, meta) in records {
            if report.remaining_bytes <= target {
                break;
            }
            match self.store.delete(&name).await {
                Ok(_) => {
                    report.remaining_bytes -= meta.content_length;
                    report.removed_bytes += meta.content_length;
                    report.removed_entries += 1;
                    self.metrics.record_eviction(meta.content_length);
                    evicted.push(name);
                }
                Err(err) => warn!(name = %name, error = %err, "failed to evict record"),
            }
        }

        {
            let mut state = self.state.lock();
            for name in &evicted {
                state.memory.remove(name);
            }
        }

        info!(
            removed_entries = report.removed_entries,
            removed_bytes = report.removed_bytes,
            remaining_bytes = report.remaining_bytes,
            "evicted oldest persistent blocks"
        );
        Ok(report)
    }
}

#[async_trait]
impl BlockCache for PersistentBlockCache {
    fn block_size(&self) -> u64 {
        self.inner.config.block_size
    }

    async fn get(&self, key: BlockKey, fetch: BlockFetch) -> Result<Bytes> {
        self.get_sized(key, fetch, None).await
    }

    async fn get_sized(
        &self,
        key: BlockKey,
        fetch: BlockFetch,
        source_size: Option<u64>,
    ) -> Result<Bytes> {
        match self.lookup(key, fetch, source_size) {
            Lookup::Hit(data) => Ok(data),
            Lookup::Pending(pending) => pending.await,
        }
    }

    fn prefetch_sized(&self, key: BlockKey, fetch: BlockFetch, source_size: Option<u64>) {
        let _ = self.lookup(key, fetch, source_size);
    }

    async fn size(&self, key: &BlockKey) -> Option<u64> {
        match self.inner.store.metadata(&key.to_string()).await {
            Ok(meta) => meta.and_then(|m| m.source_size),
            Err(err) => {
                debug!(%key, error = %err, "size hint unavailable");
                None
            }
        }
    }

    async fn clear(&self) -> Result<()> {
        let (entries, inflight) = {
            let mut state = self.inner.state.lock();
            let entries = state.memory.len();
            state.memory.clear();
            (entries, state.inflight.clear(self.inner.config.inflight_policy))
        };
        self.inner.store.clear().await?;
        info!(entries, inflight, "cleared persistent block cache");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
