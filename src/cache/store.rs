//! Durable Block Store
//!
//! Backing tier of the persistent cache. A store maps record names (rendered
//! block keys) to a payload plus small metadata used for oldest-first
//! eviction and for answering `size()` without an origin round trip.
//!
//! # Implementations
//!
//! - [`InMemoryBlobStore`]: DashMap-backed, for tests and short-lived processes
//! - [`FsBlobStore`]: one payload file and one JSON metadata file per record

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::error::Result;

/// Metadata persisted next to each block payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Payload length in bytes
    pub content_length: u64,
    /// Creation time, Unix milliseconds
    pub created_at_ms: i64,
    /// Total size of the source the block was cut from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_size: Option<u64>,
}

/// A stored block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub data: Bytes,
    pub meta: RecordMeta,
}

impl BlockRecord {
    /// Record stamped with the current time
    pub fn new(data: Bytes, source_size: Option<u64>) -> Self {
        Self::with_created_at(data, source_size, Utc::now().timestamp_millis())
    }

    /// Record with an explicit creation time
    pub fn with_created_at(data: Bytes, source_size: Option<u64>, created_at_ms: i64) -> Self {
        let meta = RecordMeta {
            content_length: data.len() as u64,
            created_at_ms,
            source_size,
        };
        Self { data, meta }
    }
}

/// Store operation counters
#[derive(Debug, Clone, Default)]
pub struct BlobStoreStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// Durable key-value store for block records
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a record
    async fn get(&self, name: &str) -> Result<Option<BlockRecord>>;

    /// Fetch only a record's metadata
    async fn metadata(&self, name: &str) -> Result<Option<RecordMeta>>;

    /// Store a record, replacing any previous one
    async fn put(&self, name: &str, record: BlockRecord) -> Result<()>;

    /// Remove a record; returns whether it existed
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Metadata of every committed record
    async fn scan(&self) -> Result<Vec<(String, RecordMeta)>>;

    /// Remove every record
    async fn clear(&self) -> Result<()>;

    /// Operation counters
    fn stats(&self) -> BlobStoreStats;
}

#[derive(Debug, Default)]
struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl OpCounters {
    fn snapshot(&self) -> BlobStoreStats {
        BlobStoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// In-memory Store
// =============================================================================

/// In-memory blob store
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    records: DashMap<String, BlockRecord>,
    ops: OpCounters,
}

impl InMemoryBlobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, name: &str) -> Result<Option<BlockRecord>> {
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.records.get(name).map(|r| r.value().clone()))
    }

    async fn metadata(&self, name: &str) -> Result<Option<RecordMeta>> {
        Ok(self.records.get(name).map(|r| r.meta))
    }

    async fn put(&self, name: &str, record: BlockRecord) -> Result<()> {
        self.ops.writes.fetch_add(1, Ordering::Relaxed);
        self.records.insert(name.to_string(), record);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.ops.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.records.remove(name).is_some())
    }

    async fn scan(&self) -> Result<Vec<(String, RecordMeta)>> {
        Ok(self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().meta))
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.records.clear();
        Ok(())
    }

    fn stats(&self) -> BlobStoreStats {
        self.ops.snapshot()
    }
}

// =============================================================================
// Filesystem Store
// =============================================================================

const PAYLOAD_EXT: &str = ".blk";
const META_EXT: &str = ".meta";
const TEMP_PREFIX: &str = ".tmp-";

/// Directory-backed blob store
///
/// Each record is `<name>.blk` plus `<name>.meta` (JSON) with the name
/// percent-encoded. Both files are written to a temp file and renamed into
/// place; the metadata file goes last and marks the record as committed.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    temp_seq: AtomicU64,
    ops: OpCounters,
}

impl FsBlobStore {
    /// Open (creating if needed) a store rooted at `root`
    ///
    /// Leftovers of interrupted writes are removed: temp files and payloads
    /// whose metadata file was never committed. The directory must not be
    /// shared with another live store.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        let store = Self {
            root,
            temp_seq: AtomicU64::new(0),
            ops: OpCounters::default(),
        };

        let removed = store.remove_orphans().await?;
        if removed > 0 {
            info!(root = %store.root.display(), removed, "removed orphaned cache files");
        }
        Ok(store)
    }

    async fn remove_orphans(&self) -> Result<usize> {
        let mut committed = HashSet::new();
        let mut candidates = Vec::new();

        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if let Some(encoded) = file_name.strip_suffix(META_EXT) {
                committed.insert(encoded.to_string());
            } else if file_name.starts_with(TEMP_PREFIX) || file_name.ends_with(PAYLOAD_EXT) {
                candidates.push(file_name);
            }
        }

        let mut removed = 0;
        for file_name in candidates {
            let orphan = match file_name.strip_suffix(PAYLOAD_EXT) {
                Some(encoded) if !file_name.starts_with(TEMP_PREFIX) => {
                    !committed.contains(encoded)
                }
                _ => true,
            };
            if orphan && remove_if_exists(&self.root.join(&file_name)).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Store directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, name: &str, ext: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", urlencoding::encode(name), ext))
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let temp = self
            .root
            .join(format!("{}{}-{}", TEMP_PREFIX, std::process::id(), seq));

        if let Err(err) = fs::write(&temp, contents).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn read_meta(&self, path: &Path) -> Result<Option<RecordMeta>> {
        match fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, name: &str) -> Result<Option<BlockRecord>> {
        self.ops.reads.fetch_add(1, Ordering::Relaxed);

        let Some(meta) = self.read_meta(&self.record_path(name, META_EXT)).await? else {
            return Ok(None);
        };

        let data = match fs::read(self.record_path(name, PAYLOAD_EXT)).await {
            Ok(data) => Bytes::from(data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(name, "dropping record with missing payload");
                self.delete(name).await?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        if data.len() as u64 != meta.content_length {
            warn!(
                name,
                expected = meta.content_length,
                actual = data.len(),
                "dropping record with torn payload"
            );
            self.delete(name).await?;
            return Ok(None);
        }

        Ok(Some(BlockRecord { data, meta }))
    }

    async fn metadata(&self, name: &str) -> Result<Option<RecordMeta>> {
        self.read_meta(&self.record_path(name, META_EXT)).await
    }

    async fn put(&self, name: &str, record: BlockRecord) -> Result<()> {
        self.ops.writes.fetch_add(1, Ordering::Relaxed);

        self.write_atomic(&self.record_path(name, PAYLOAD_EXT), &record.data)
            .await?;
        let meta = serde_json::to_vec(&record.meta)?;
        self.write_atomic(&self.record_path(name, META_EXT), &meta)
            .await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.ops.deletes.fetch_add(1, Ordering::Relaxed);

        // Uncommit first so a concurrent scan never sees a half-deleted record
        let existed = remove_if_exists(&self.record_path(name, META_EXT)).await?;
        remove_if_exists(&self.record_path(name, PAYLOAD_EXT)).await?;
        Ok(existed)
    }

    async fn scan(&self) -> Result<Vec<(String, RecordMeta)>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(encoded) = file_name
                .to_str()
                .and_then(|f| f.strip_suffix(META_EXT))
            else {
                continue;
            };
            let Ok(name) = urlencoding::decode(encoded) else {
                warn!(file = encoded, "skipping record with undecodable name");
                continue;
            };

            match self.read_meta(&entry.path()).await {
                Ok(Some(meta)) => records.push((name.into_owned(), meta)),
                // Deleted between listing and reading
                Ok(None) => {}
                Err(err) => warn!(name = %name, error = %err, "skipping unreadable record"),
            }
        }

        Ok(records)
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ours = path
                .file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| {
                    f.starts_with(TEMP_PREFIX) || f.ends_with(META_EXT) || f.ends_with(PAYLOAD_EXT)
                });
            if ours {
                remove_if_exists(&path).await?;
            }
        }
        Ok(())
    }

    fn stats(&self) -> BlobStoreStats {
        self.ops.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================
