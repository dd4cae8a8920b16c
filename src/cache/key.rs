//! Block Keys and Source Identity
//!
//! A block key names one fixed-size block of one particular version of a
//! source. The version half is a [`SourceIdentity`] fingerprint built from the
//! source location and its mutation markers, so a mutated origin lands in a
//! fresh key namespace and stale blocks simply become unreachable.

use std::fmt;

/// FNV-1a 64-bit hash
#[inline]
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

// =============================================================================
// Source Identity
// =============================================================================

/// Fingerprint of one version of a byte source
///
/// `hash(location) ^ hash(last_modified) ^ hash(etag)`; absent markers
/// contribute nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceIdentity(u64);

impl SourceIdentity {
    /// Identity from location and mutation markers
    pub fn new(location: &str, last_modified: Option<&str>, etag: Option<&str>) -> Self {
        let location_hash = fnv1a_64(location.as_bytes());
        let modified_hash = last_modified.map_or(0, |m| fnv1a_64(m.as_bytes()));
        let etag_hash = etag.map_or(0, |e| fnv1a_64(e.as_bytes()));
        Self(location_hash ^ modified_hash ^ etag_hash)
    }

    /// Identity from location only
    ///
    /// Only safe for origins that never change in place.
    pub fn from_location(location: &str) -> Self {
        Self::new(location, None, None)
    }

    /// Wrap a precomputed fingerprint
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw 64-bit fingerprint
    #[inline]
    pub fn fingerprint(&self) -> u64 {
        self.0
    }

    /// Key of block `index` under this identity
    #[inline]
    pub fn block(&self, anchor: BlockAnchor, index: u64) -> BlockKey {
        BlockKey::new(*self, anchor, index)
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// =============================================================================
// Block Anchor
// =============================================================================

/// Which end of the source block indices count from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BlockAnchor {
    /// `index = offset / block_size`
    #[default]
    Start,
    /// `index = (len - offset - 1) / block_size`
    ///
    /// Keeps the trailing block's key stable as the source grows.
    End,
}

impl BlockAnchor {
    /// Index of the block containing byte `offset`
    #[inline]
    pub fn index_of(&self, offset: u64, len: u64, block_size: u64) -> u64 {
        match self {
            BlockAnchor::Start => offset / block_size,
            BlockAnchor::End => (len - offset - 1) / block_size,
        }
    }

    /// Byte range `[start, end)` covered by block `index`
    #[inline]
    pub fn block_range(&self, index: u64, len: u64, block_size: u64) -> (u64, u64) {
        match self {
            BlockAnchor::Start => {
                let start = index * block_size;
                (start, (start + block_size).min(len))
            }
            BlockAnchor::End => {
                let end = len - index * block_size;
                (end.saturating_sub(block_size), end)
            }
        }
    }

    /// Inclusive block index range covering `[offset, offset + size)`
    ///
    /// Returned low-to-high regardless of anchor. Requires `size > 0` and
    /// `offset + size <= len`.
    pub fn index_span(&self, offset: u64, size: u64, len: u64, block_size: u64) -> (u64, u64) {
        let first = self.index_of(offset, len, block_size);
        let last = self.index_of(offset + size - 1, len, block_size);
        (first.min(last), first.max(last))
    }

    fn label(&self) -> &'static str {
        match self {
            BlockAnchor::Start => "start",
            BlockAnchor::End => "end",
        }
    }
}

// =============================================================================
// Block Key
// =============================================================================

/// Key of a single cached block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockKey {
    source: SourceIdentity,
    anchor: BlockAnchor,
    index: u64,
}

impl BlockKey {
    /// Create a new block key
    pub fn new(source: SourceIdentity, anchor: BlockAnchor, index: u64) -> Self {
        Self {
            source,
            anchor,
            index,
        }
    }

    /// Source version half of the key
    #[inline]
    pub fn source(&self) -> SourceIdentity {
        self.source
    }

    /// Anchor the index counts from
    #[inline]
    pub fn anchor(&self) -> BlockAnchor {
        self.anchor
    }

    /// Block index
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }
}

/// Stable record name, e.g. `00ab..ef/end/3`
impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.source, self.anchor.label(), self.index)
    }
}

// =============================================================================
// Tests
// =============================================================================
