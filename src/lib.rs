//! rangecache - Block-aligned Byte-range Caching
//!
//! Random-access reads over remote or local byte sequences, served through a
//! shared block cache so that many small reads turn into a few whole-block
//! origin requests.
//!
//! # Architecture
//!
//! ```text
//! Decoder ──► CachedByteRangeBackend ──► BlockCache ──► ByteRangeSource
//!                 (range → blocks)      (LRU / two-tier)   (HTTP / file / memory)
//! ```
//!
//! Blocks are keyed by a fingerprint of the source version, so a changed
//! origin never serves stale bytes.
//!
//! # Modules
//!
//! - [`backend`] - Cached byte-range backend
//! - [`cache`] - Block caches, keys and the persistent blob store
//! - [`error`] - Error types
//! - [`source`] - Byte-range sources and prefetch scheduling

pub mod backend;
pub mod cache;
pub mod error;
pub mod source;

// Re-export commonly used types
pub use backend::{BackendOptions, CachedByteRangeBackend};
pub use cache::{
    BlockAnchor, BlockCache, BlockKey, FsBlobStore, InflightPolicy, LruBlockCache,
    PersistentBlockCache, PersistentCacheConfig, SourceIdentity,
};
pub use error::{Error, Result};
pub use source::{
    run_limited, ByteRangeSource, FileSource, HttpRangeSource, HttpSourceConfig, MemorySource,
    PrefetchTask, RetryPolicy,
};

/// Crate version, sent in the default `User-Agent`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
