//! Storage handles.
//!
//! The cache never performs disk I/O itself; it only needs to tell pieces
//! from different torrents apart and to know each piece's block geometry.
//! A [`StorageHandle`] is the opaque, shared identifier the disk layer
//! hands to every job. Pieces outlive individual jobs, so the handle is
//! reference counted and cheap to clone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::constants::BLOCK_SIZE;

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Which hash flavor pieces of this storage are verified with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashVersion {
    /// SHA-1 flat piece hashes (v1 torrents).
    V1,
    /// SHA-256 per-block hashes (v2 torrents).
    V2,
}

#[derive(Debug)]
struct StorageInfo {
    id: u64,
    piece_length: u32,
    total_len: u64,
    version: HashVersion,
}

/// Shared identifier for one torrent's storage.
///
/// Equality and hashing use the handle's identity, not its geometry: two
/// handles compare equal only if they were cloned from the same
/// [`StorageHandle::new`] call.
#[derive(Debug, Clone)]
pub struct StorageHandle {
    inner: Arc<StorageInfo>,
}

impl StorageHandle {
    /// Creates a handle for a v1 storage with uniform `piece_length`
    /// covering `total_len` bytes.
    pub fn new(piece_length: u32, total_len: u64) -> Self {
        Self::with_version(piece_length, total_len, HashVersion::V1)
    }

    /// Creates a handle for a v2 storage.
    pub fn new_v2(piece_length: u32, total_len: u64) -> Self {
        Self::with_version(piece_length, total_len, HashVersion::V2)
    }

    fn with_version(piece_length: u32, total_len: u64, version: HashVersion) -> Self {
        assert!(piece_length > 0, "piece length must be non-zero");
        Self {
            inner: Arc::new(StorageInfo {
                id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
                piece_length,
                total_len,
                version,
            }),
        }
    }

    /// Stable identity of this storage, unique within the process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Hash flavor used for pieces of this storage.
    pub fn hash_version(&self) -> HashVersion {
        self.inner.version
    }

    /// Number of pieces in this storage.
    pub fn num_pieces(&self) -> u32 {
        self.inner
            .total_len
            .div_ceil(u64::from(self.inner.piece_length)) as u32
    }

    /// Length in bytes of the given piece. The last piece may be shorter.
    pub fn piece_len(&self, piece: u32) -> u32 {
        let start = u64::from(piece) * u64::from(self.inner.piece_length);
        debug_assert!(start < self.inner.total_len, "piece index out of range");
        (self.inner.total_len - start).min(u64::from(self.inner.piece_length)) as u32
    }

    /// Number of block slots in the given piece.
    pub fn blocks_in_piece(&self, piece: u32) -> usize {
        (self.piece_len(piece) as usize).div_ceil(BLOCK_SIZE)
    }
}

impl PartialEq for StorageHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for StorageHandle {}

impl std::hash::Hash for StorageHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}
