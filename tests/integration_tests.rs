//! rangecache Integration Tests
//!
//! End-to-end reads through `CachedByteRangeBackend`:
//! - Block stitching and fetch deduplication
//! - Source identity and stale data
//! - Cancellation and prefetch scheduling
//! - Two-tier cache lifetime and eviction

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use rangecache::{ByteRangeSource, Error, MemorySource, Result};

/// Origin that records every range it serves
struct RecordingSource {
    inner: MemorySource,
    calls: Mutex<Vec<(u64, u64)>>,
    stalled: AtomicBool,
    failing: AtomicBool,
}

impl RecordingSource {
    fn new(data: impl Into<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemorySource::new(data),
            calls: Mutex::new(Vec::new()),
            stalled: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        })
    }

    fn sequence(len: u8) -> Arc<Self> {
        Self::new((0..len).collect::<Vec<u8>>())
    }

    /// Every later `get_bytes` hangs forever
    fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Toggle transport failures for later `get_bytes` calls
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<(u64, u64)> {
        let mut calls = self.calls.lock().clone();
        calls.sort_unstable();
        calls
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ByteRangeSource for RecordingSource {
    async fn get_bytes(&self, offset: u64, size: u64) -> Result<Bytes> {
        self.calls.lock().push((offset, size));
        if self.stalled.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection reset".into()));
        }
        self.inner.get_bytes(offset, size).await
    }

    async fn count(&self) -> Result<u64> {
        self.inner.count().await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Block Stitching Tests
// =============================================================================

mod backend_tests {
    use super::*;
    use rangecache::{BlockCache, CachedByteRangeBackend, LruBlockCache, SourceIdentity};

    fn lru(block_size: u64) -> Arc<dyn BlockCache> {
        Arc::new(LruBlockCache::new(block_size, 128).unwrap())
    }

    #[tokio::test]
    async fn test_read_spanning_two_blocks() {
        let source = RecordingSource::sequence(16);
        let backend =
            CachedByteRangeBackend::from_start(source.clone(), lru(4), SourceIdentity::from_location("mem"));

        let data = backend.get_bytes(2, 6).await.unwrap();
        assert_eq!(data.as_ref(), &[2, 3, 4, 5, 6, 7]);
        assert_eq!(source.calls(), vec![(0, 4), (4, 4)]);

        // Fully cached now
        let again = backend.get_bytes(3, 4).await.unwrap();
        assert_eq!(again.as_ref(), &[3, 4, 5, 6]);
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test]
    async fn test_tail_anchored_blocks_align_to_end() {
        let source = RecordingSource::sequence(10);
        let backend =
            CachedByteRangeBackend::from_end(source.clone(), lru(4), SourceIdentity::from_location("mem"));

        let (tail, len) = backend.get_bytes_from_end(4).await.unwrap();
        assert_eq!(tail.as_ref(), &[6, 7, 8, 9]);
        assert_eq!(len, 10);
        assert_eq!(source.calls(), vec![(6, 4)]);

        // Short leading block
        let head = backend.get_bytes(0, 3).await.unwrap();
        assert_eq!(head.as_ref(), &[0, 1, 2]);
        assert_eq!(source.calls(), vec![(0, 2), (2, 4), (6, 4)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_fetch_each_block_once() {
        let source = RecordingSource::sequence(64);
        let backend = Arc::new(CachedByteRangeBackend::from_start(
            source.clone(),
            lru(8),
            SourceIdentity::from_location("mem"),
        ));

        let reads: Vec<_> = (0..16)
            .map(|i| {
                let backend = backend.clone();
                tokio::spawn(async move { backend.get_bytes(i, 40).await })
            })
            .collect();

        for (i, read) in reads.into_iter().enumerate() {
            let data = read.await.unwrap().unwrap();
            assert_eq!(data[0], i as u8);
            assert_eq!(data.len(), 40);
        }

        let calls = source.calls();
        let mut unique = calls.clone();
        unique.dedup();
        assert_eq!(calls, unique, "a block was fetched twice");
    }

    #[tokio::test]
    async fn test_close_leaves_shared_cache() {
        let cache = lru(4);
        let identity = SourceIdentity::from_location("mem");

        let first = CachedByteRangeBackend::from_start(RecordingSource::sequence(8), cache.clone(), identity);
        first.get_bytes(0, 8).await.unwrap();
        first.close().await.unwrap();

        let source = RecordingSource::sequence(8);
        let second = CachedByteRangeBackend::from_start(source.clone(), cache, identity);
        assert_eq!(second.get_bytes(0, 8).await.unwrap().len(), 8);
        assert_eq!(source.call_count(), 0);
    }
}

// =============================================================================
// Source Identity Tests
// =============================================================================

mod identity_tests {
    use super::*;
    use rangecache::{BlockAnchor, CachedByteRangeBackend, LruBlockCache, SourceIdentity};

    #[tokio::test]
    async fn test_changed_etag_never_serves_stale_blocks() {
        let cache = Arc::new(LruBlockCache::new(4, 64).unwrap());
        let v1 = SourceIdentity::new("https://host/obj", None, Some("\"v1\""));
        let v2 = SourceIdentity::new("https://host/obj", None, Some("\"v2\""));
        assert_ne!(v1, v2);

        let old = CachedByteRangeBackend::from_start(RecordingSource::new(vec![1u8; 8]), cache.clone(), v1);
        assert_eq!(old.get_bytes(0, 8).await.unwrap().as_ref(), &[1u8; 8]);

        let source = RecordingSource::new(vec![2u8; 8]);
        let new = CachedByteRangeBackend::from_start(source.clone(), cache.clone(), v2);
        assert_eq!(new.get_bytes(0, 8).await.unwrap().as_ref(), &[2u8; 8]);
        assert_eq!(source.call_count(), 2);

        assert!(cache.contains(&v1.block(BlockAnchor::Start, 0)));
        assert!(cache.contains(&v2.block(BlockAnchor::Start, 0)));
    }

    #[test]
    fn test_identity_depends_on_every_marker() {
        let base = SourceIdentity::new("loc", Some("Mon, 01 Jan 2024 00:00:00 GMT"), Some("e"));
        assert_ne!(base, SourceIdentity::new("loc", Some("Tue, 02 Jan 2024 00:00:00 GMT"), Some("e")));
        assert_ne!(base, SourceIdentity::new("loc", Some("Mon, 01 Jan 2024 00:00:00 GMT"), None));
        assert_ne!(base, SourceIdentity::new("other", Some("Mon, 01 Jan 2024 00:00:00 GMT"), Some("e")));
        assert_eq!(base, SourceIdentity::new("loc", Some("Mon, 01 Jan 2024 00:00:00 GMT"), Some("e")));
    }
}

// =============================================================================
// Cancellation & Prefetch Tests
// =============================================================================

mod scheduling_tests {
    use super::*;
    use rangecache::{
        run_limited, BackendOptions, BlockCache, CachedByteRangeBackend, LruBlockCache,
        SourceIdentity,
    };
    use tokio_util::sync::CancellationToken;

    fn backend(source: Arc<RecordingSource>, parallel: usize) -> (CachedByteRangeBackend, Arc<LruBlockCache>) {
        let cache = Arc::new(LruBlockCache::new(4, 64).unwrap());
        let shared: Arc<dyn BlockCache> = cache.clone();
        let backend = CachedByteRangeBackend::from_start(source, shared, SourceIdentity::from_location("mem"))
            .with_options(BackendOptions {
                max_parallel_blocks: Some(parallel),
            });
        (backend, cache)
    }

    #[tokio::test]
    async fn test_cancel_mid_read_stops_block_fetches() {
        let source = RecordingSource::sequence(16);
        source.stall();
        let (backend, _) = backend(source.clone(), 1);
        let backend = Arc::new(backend);

        let token = CancellationToken::new();
        let read = {
            let backend = backend.clone();
            let token = token.clone();
            tokio::spawn(async move { backend.get_bytes_cancellable(0, 16, &token).await })
        };

        while source.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        token.cancel();

        assert_eq!(read.await.unwrap(), Err(Error::Cancelled));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(source.calls(), vec![(0, 4)]);
    }

    #[tokio::test]
    async fn test_precancelled_read_does_nothing() {
        let source = RecordingSource::sequence(16);
        let (backend, _) = backend(source.clone(), 4);

        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(backend.get_bytes_cancellable(0, 16, &token).await, Err(Error::Cancelled));
        assert_eq!(source.call_count(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_tasks_are_lazy_and_warm_the_cache() {
        let source = RecordingSource::sequence(32);
        let (backend, cache) = backend(source.clone(), 4);

        let tasks = backend.collect_prefetch_tasks(6, 12).await.unwrap();
        assert_eq!(tasks.len(), 4);
        assert_eq!(source.call_count(), 0);

        run_limited(tasks, 2, None).await.unwrap();
        assert_eq!(source.calls(), vec![(4, 4), (8, 4), (12, 4), (16, 4)]);
        assert_eq!(cache.len(), 4);

        backend.get_bytes(6, 12).await.unwrap();
        assert_eq!(source.call_count(), 4);
    }

    #[tokio::test]
    async fn test_prefetch_failures_are_swallowed() {
        let source = RecordingSource::sequence(8);
        let (backend, cache) = backend(source.clone(), 4);

        source.set_failing(true);
        let tasks = backend.collect_prefetch_tasks(0, 8).await.unwrap();
        run_limited(tasks, 8, None).await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.metrics().snapshot().fetch_errors, 2);

        // Failures were not cached
        source.set_failing(false);
        assert_eq!(backend.get_bytes(0, 8).await.unwrap().len(), 8);
        assert_eq!(source.call_count(), 4);

        assert!(matches!(
            backend.collect_prefetch_tasks(4, 8).await,
            Err(Error::OutOfRange { .. })
        ));
    }
}

// =============================================================================
// Two-tier Cache Tests
// =============================================================================

mod persistent_tests {
    use super::*;
    use rangecache::{
        BlockCache, CachedByteRangeBackend, FsBlobStore, PersistentBlockCache,
        PersistentCacheConfig, SourceIdentity,
    };

    fn config() -> PersistentCacheConfig {
        PersistentCacheConfig {
            block_size: 4,
            memory_ttl: Duration::from_secs(1),
            max_bytes: 16,
            eviction_fraction: 0.5,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_blocks_come_from_persistent_tier() {
        let cache = PersistentBlockCache::in_memory(config()).unwrap();
        let source = RecordingSource::sequence(8);
        let backend = CachedByteRangeBackend::from_start(
            source.clone(),
            Arc::new(cache.clone()),
            SourceIdentity::from_location("mem"),
        );

        backend.get_bytes(0, 4).await.unwrap();
        backend.get_bytes(0, 4).await.unwrap();
        assert_eq!(cache.metrics().memory_hits(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(backend.get_bytes(0, 4).await.unwrap().as_ref(), &[0, 1, 2, 3]);
        assert_eq!(cache.metrics().persistent_hits(), 1);
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn test_eviction_keeps_usage_under_target() {
        let cache = PersistentBlockCache::in_memory(config()).unwrap();
        let source = RecordingSource::sequence(32);
        let backend = CachedByteRangeBackend::from_start(
            source.clone(),
            Arc::new(cache.clone()),
            SourceIdentity::from_location("mem"),
        );

        backend.get_bytes(0, 32).await.unwrap();

        // Waits out any running pass, then scans everything written so far
        cache.evict_if_needed().await.unwrap();

        // 32 bytes written against a 16 byte budget, trimmed to 8
        let stats = cache.stats().await.unwrap();
        assert!(stats.persistent_bytes <= 8, "usage {}", stats.persistent_bytes);
        assert!(stats.metrics.evictions >= 4);

        // Evicted blocks are fetched again
        cache.clear().await.unwrap();
        assert_eq!(backend.get_bytes(0, 32).await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_filesystem_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let identity = SourceIdentity::from_location("mem");
        let config = PersistentCacheConfig {
            block_size: 4,
            ..Default::default()
        };

        {
            let store = FsBlobStore::open(dir.path()).await.unwrap();
            let cache = PersistentBlockCache::with_config(Arc::new(store), config.clone()).unwrap();
            let backend =
                CachedByteRangeBackend::from_end(RecordingSource::sequence(12), Arc::new(cache), identity);
            backend.get_bytes_from_end(12).await.unwrap();
        }

        let store = FsBlobStore::open(dir.path()).await.unwrap();
        let cache: Arc<dyn BlockCache> =
            Arc::new(PersistentBlockCache::with_config(Arc::new(store), config).unwrap());
        let source = RecordingSource::sequence(12);
        let backend = CachedByteRangeBackend::from_end(source.clone(), cache, identity);

        assert_eq!(backend.count().await.unwrap(), 12);
        let (data, _) = backend.get_bytes_from_end(12).await.unwrap();
        assert_eq!(data.as_ref(), (0u8..12).collect::<Vec<_>>().as_slice());
        assert_eq!(source.call_count(), 0);
    }
}
