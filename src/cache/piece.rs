//! Cached piece and block entries.
//!
//! A piece entry owns one slot per block of its piece. Slots hold the
//! block buffer (if resident), a reference count protecting the buffer
//! from reclamation, and the dirty/pending/cache-hit flags that drive the
//! write path and the ARC promotion rules.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::job::DiskJob;
use crate::storage::{HashVersion, StorageHandle};

/// Key of a resident piece: `(storage id, piece index)`.
pub type PieceKey = (u64, u32);

/// Upper bound on a single block's reference count (29 bits).
pub const MAX_BLOCK_REFCOUNT: u32 = (1 << 29) - 1;

/// Upper bound on the number of threads holding a piece (7 bits).
pub const MAX_PIECE_REFCOUNT: u32 = (1 << 7) - 1;

/// Which LRU list a piece is chained into.
///
/// The discriminants are ordered by importance: allocating a piece with a
/// state numerically lower than its current one relinks it (ghost
/// entries become real again, read pieces become write pieces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    /// Pieces with dirty blocks awaiting flush.
    Write = 0,
    /// One-shot read pieces; always evicted first.
    Volatile = 1,
    /// Read pieces requested once recently (ARC T1).
    Read1 = 2,
    /// Headers of pieces evicted from `Read1` (ARC B1).
    Read1Ghost = 3,
    /// Frequently requested read pieces (ARC T2).
    Read2 = 4,
    /// Headers of pieces evicted from `Read2` (ARC B2).
    Read2Ghost = 5,
}

impl CacheState {
    /// Number of LRU lists.
    pub const COUNT: usize = 6;

    /// True for the two ghost lists.
    pub fn is_ghost(self) -> bool {
        matches!(self, CacheState::Read1Ghost | CacheState::Read2Ghost)
    }

    /// The ghost list pieces of this state are demoted to, if any.
    pub(crate) fn ghost(self) -> Option<CacheState> {
        match self {
            CacheState::Read1 => Some(CacheState::Read1Ghost),
            CacheState::Read2 => Some(CacheState::Read2Ghost),
            _ => None,
        }
    }

    /// The real list a ghost state is promoted back into; identity for
    /// non-ghost states.
    pub(crate) fn real(self) -> CacheState {
        match self {
            CacheState::Read1Ghost => CacheState::Read1,
            CacheState::Read2Ghost => CacheState::Read2,
            s => s,
        }
    }
}

/// Why a block buffer is pinned. Debug builds keep one subcount per
/// reason so mispaired inc/dec calls are caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Reason {
    /// Held by a hash worker.
    Hashing = 0,
    /// Held in a peer's send buffer.
    Reading = 1,
    /// Held by an in-flight flush.
    Flushing = 2,
}

/// Incremental hash context, SHA-1 for v1 storages and SHA-256 for v2.
#[derive(Clone)]
pub enum HashState {
    V1(Sha1),
    V2(Sha256),
}

impl HashState {
    pub fn new(version: HashVersion) -> Self {
        match version {
            HashVersion::V1 => HashState::V1(Sha1::new()),
            HashVersion::V2 => HashState::V2(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            HashState::V1(h) => h.update(data),
            HashState::V2(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            HashState::V1(h) => h.finalize().to_vec(),
            HashState::V2(h) => h.finalize().to_vec(),
        }
    }
}

/// Interim hashing state for a piece: the byte offset hashed so far and
/// the hash context covering exactly those bytes.
#[derive(Clone)]
pub struct PartialHash {
    pub(crate) offset: u32,
    pub(crate) state: HashState,
}

impl PartialHash {
    pub(crate) fn new(version: HashVersion) -> Self {
        Self {
            offset: 0,
            state: HashState::new(version),
        }
    }

    /// Bytes of the piece consumed so far.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        self.state.update(data);
        self.offset += data.len() as u32;
    }
}

impl std::fmt::Debug for PartialHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialHash")
            .field("offset", &self.offset)
            .finish()
    }
}

/// One block slot within a piece.
#[derive(Debug, Default)]
pub(crate) struct CachedBlock {
    /// The block data, if resident. Not itself counted as a reference.
    pub buf: Option<Bytes>,
    /// References held outside the cache (send buffers, hash workers,
    /// flushes). The buffer may not be freed while this is non-zero.
    pub refcount: u32,
    /// The block must be written to storage before its buffer may be
    /// reclaimed.
    pub dirty: bool,
    /// An outstanding job targets this slot; the buffer is not yet valid
    /// for readers (reads) or not yet durable (writes).
    pub pending: bool,
    /// The block has been read at least once. A second hit promotes the
    /// whole piece to the frequent list.
    pub cache_hit: bool,
    #[cfg(debug_assertions)]
    pub reason_counts: [u32; 3],
}

impl CachedBlock {
    /// True if the slot's buffer exists and may be freed.
    pub fn evictable(&self) -> bool {
        self.buf.is_some() && self.refcount == 0 && !self.dirty && !self.pending
    }
}

/// A piece resident in the cache (possibly as a buffer-less ghost).
pub struct CachedPiece {
    pub(crate) storage: StorageHandle,
    pub(crate) piece: u32,
    pub(crate) blocks: Box<[CachedBlock]>,

    /// Write jobs hanging off this piece, completed when their blocks
    /// flush, in arrival order.
    pub(crate) jobs: VecDeque<DiskJob>,
    /// Read jobs deferred behind the outstanding read on this piece.
    pub(crate) read_jobs: VecDeque<DiskJob>,

    /// Interim hashing state, if a hash is in progress.
    pub(crate) hash: Option<PartialHash>,

    pub(crate) cache_state: CacheState,
    /// Minimum time the piece's dirty blocks stay cached before the
    /// external flush policy is expected to pick them up.
    pub(crate) expire: Instant,

    /// Threads currently holding this piece. It may not be removed while
    /// this is non-zero.
    pub(crate) piece_refcount: u32,
    /// Sum of all block refcounts.
    pub(crate) refcount: u32,
    /// Blocks with refcount > 0.
    pub(crate) pinned: u32,
    /// Slots with a resident buffer.
    pub(crate) num_blocks: u16,
    /// Slots with the dirty flag set.
    pub(crate) num_dirty: u16,

    pub(crate) hashing: bool,
    pub(crate) hashing_done: bool,
    pub(crate) marked_for_eviction: bool,
    pub(crate) marked_for_deletion: bool,
    pub(crate) need_readback: bool,
    pub(crate) outstanding_flush: bool,
    pub(crate) outstanding_read: bool,
}

impl CachedPiece {
    pub(crate) fn new(
        storage: StorageHandle,
        piece: u32,
        cache_state: CacheState,
        expire: Instant,
    ) -> Self {
        let slots = storage.blocks_in_piece(piece);
        let mut blocks = Vec::with_capacity(slots);
        blocks.resize_with(slots, CachedBlock::default);
        Self {
            storage,
            piece,
            blocks: blocks.into_boxed_slice(),
            jobs: VecDeque::new(),
            read_jobs: VecDeque::new(),
            hash: None,
            cache_state,
            expire,
            piece_refcount: 0,
            refcount: 0,
            pinned: 0,
            num_blocks: 0,
            num_dirty: 0,
            hashing: false,
            hashing_done: false,
            marked_for_eviction: false,
            marked_for_deletion: false,
            need_readback: false,
            outstanding_flush: false,
            outstanding_read: false,
        }
    }

    pub(crate) fn key(&self) -> PieceKey {
        (self.storage.id(), self.piece)
    }

    /// Whether the piece may be removed from the cache right now. With
    /// `ignore_hash` the partial-hash cursor is not considered (used when
    /// the piece is being torn down and the hash will be discarded).
    pub fn ok_to_evict(&self, ignore_hash: bool) -> bool {
        self.refcount == 0
            && self.piece_refcount == 0
            && !self.hashing
            && self.read_jobs.is_empty()
            && !self.outstanding_read
            && (ignore_hash || self.hash.as_ref().map_or(true, |h| h.offset == 0))
    }

    /// Storage this piece belongs to.
    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    /// Piece index within its storage.
    pub fn piece(&self) -> u32 {
        self.piece
    }

    /// LRU list the piece is currently chained into.
    pub fn cache_state(&self) -> CacheState {
        self.cache_state
    }

    /// Number of block slots in the piece.
    pub fn blocks_in_piece(&self) -> usize {
        self.blocks.len()
    }

    /// Slots with a resident buffer.
    pub fn num_blocks(&self) -> usize {
        usize::from(self.num_blocks)
    }

    /// Slots with the dirty flag set.
    pub fn num_dirty(&self) -> usize {
        usize::from(self.num_dirty)
    }

    /// Blocks with refcount > 0.
    pub fn pinned(&self) -> usize {
        self.pinned as usize
    }

    /// Sum of all block refcounts.
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Threads currently holding the piece.
    pub fn piece_refcount(&self) -> u32 {
        self.piece_refcount
    }

    /// Byte offset hashed so far, if a hash is in progress.
    pub fn hash_offset(&self) -> Option<u32> {
        self.hash.as_ref().map(|h| h.offset)
    }

    /// Blocks past the hash cursor were flushed; hashing must re-read
    /// them from storage.
    pub fn need_readback(&self) -> bool {
        self.need_readback
    }

    /// An async hash job is working on this piece.
    pub fn is_hashing(&self) -> bool {
        self.hashing
    }

    /// At least one hash job has completed for this piece.
    pub fn hashing_done(&self) -> bool {
        self.hashing_done
    }

    /// A read is outstanding; new reads should be deferred.
    pub fn outstanding_read(&self) -> bool {
        self.outstanding_read
    }

    /// A flush job is outstanding; no need to issue another.
    pub fn outstanding_flush(&self) -> bool {
        self.outstanding_flush
    }

    /// The piece is erased (not just demoted) once its refcounts drain.
    pub fn marked_for_deletion(&self) -> bool {
        self.marked_for_deletion
    }

    /// The piece is demoted to a ghost list once its refcounts drain.
    pub fn marked_for_eviction(&self) -> bool {
        self.marked_for_eviction
    }

    /// Expiration timestamp of the piece's write-cache residency.
    pub fn expire(&self) -> Instant {
        self.expire
    }

    /// True if the slot holds a resident buffer.
    pub fn block_present(&self, block: usize) -> bool {
        self.blocks.get(block).map_or(false, |b| b.buf.is_some())
    }

    /// True if the slot is dirty.
    pub fn block_dirty(&self, block: usize) -> bool {
        self.blocks.get(block).map_or(false, |b| b.dirty)
    }

    /// Reference count of the slot.
    pub fn block_refcount(&self, block: usize) -> u32 {
        self.blocks.get(block).map_or(0, |b| b.refcount)
    }
}

impl std::fmt::Debug for CachedPiece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedPiece")
            .field("storage", &self.storage.id())
            .field("piece", &self.piece)
            .field("cache_state", &self.cache_state)
            .field("num_blocks", &self.num_blocks)
            .field("num_dirty", &self.num_dirty)
            .field("refcount", &self.refcount)
            .field("pinned", &self.pinned)
            .finish()
    }
}
