//! Cache Metrics
//!
//! Lock-free counters shared by every block cache implementation. Each cache
//! owns one [`CacheMetrics`]; the binary exports snapshots in Prometheus text
//! format.

use std::sync::atomic::{AtomicU64, Ordering};

/// Block cache counters
#[derive(Debug, Default)]
pub struct CacheMetrics {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    fetch_errors: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
}

impl CacheMetrics {
    /// Create a zeroed metrics set
    pub fn new() -> Self {
        Self::default()
    }

    // Lookups
    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistent_hit(&self) {
        self.persistent_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller attached to a fetch that was already in flight
    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Eviction
    pub fn record_eviction(&self, bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn memory_hits(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed)
    }

    pub fn persistent_hits(&self) -> u64 {
        self.persistent_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Share of lookups served without going to the origin
    ///
    /// Coalesced lookups count as hits: they did not cause an origin fetch.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.memory_hits() + self.persistent_hits() + self.coalesced.load(Ordering::Relaxed);
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.memory_hits(),
            persistent_hits: self.persistent_hits(),
            misses: self.misses(),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            evictions: self.evictions(),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub fetch_errors: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub hit_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================
