//! The ARC block cache.
//!
//! Pieces live in a hash table keyed by `(storage, piece)` and are chained
//! into one of six LRU lists: the write list for pieces with dirty blocks,
//! the volatile list for one-shot reads, two real read lists (recently and
//! frequently used) and their two ghost lists. Ghost entries keep the
//! piece header but no buffers; hitting one biases eviction toward the
//! other real list, which is what makes the policy adaptive.
//!
//! The cache is a passive structure: it never blocks and never performs
//! I/O. All methods must be called from the disk thread, or while holding
//! the disk mutex (see [`SharedCache`]). The only cross-thread traffic is
//! block pins: buffers handed to send paths or hash workers stay pinned
//! until the owning thread posts the release back to the disk thread.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::buffer_pool::BufferPool;
use super::lru::LruList;
use super::piece::{
    CachedPiece, CacheState, PartialHash, PieceKey, Reason, MAX_BLOCK_REFCOUNT,
    MAX_PIECE_REFCOUNT,
};
use crate::constants::BLOCK_SIZE;
use crate::error::{JobError, TryReadError};
use crate::job::DiskJob;
use crate::settings::CacheSettings;
use crate::storage::StorageHandle;

/// Nature of the most recent lookup. Decides which real list the next
/// eviction drains first: a ghost hit in B1 means the recent working set
/// is growing, so victims come from the frequent list, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    CacheMiss,
    GhostHitLru1,
    GhostHitLru2,
}

/// Whether an evicted piece leaves a ghost entry behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    /// Demote to the matching ghost list.
    AllowGhost,
    /// Erase the entry entirely.
    DisallowGhost,
}

/// Handle to a block pinned for a peer's send buffer. Return it through
/// [`BlockCache::reclaim_block`] once the send completes.
#[derive(Debug)]
pub struct BlockRef {
    storage: StorageHandle,
    piece: u32,
    block: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    /// Clean blocks resident in the cache.
    read_cache_size: usize,
    /// Dirty blocks awaiting flush.
    write_cache_size: usize,
    /// Blocks held by pieces on the volatile list.
    volatile_size: usize,
    /// Blocks with refcount > 0.
    pinned_blocks: usize,
    /// Pins held by peer send buffers (counted per pin, not per buffer).
    send_buffer_blocks: usize,
}

/// Point-in-time counters, for session statistics.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub read_cache_size: usize,
    pub write_cache_size: usize,
    pub volatile_size: usize,
    pub pinned_blocks: usize,
    pub send_buffer_blocks: usize,
    pub num_pieces: usize,
    pub write_lru_pieces: usize,
    pub ghost1_pieces: usize,
    pub ghost2_pieces: usize,
    pub last_cache_op: CacheOp,
}

/// Frees one block slot and fixes every derived counter.
///
/// The slot must be unpinned. Kept as a free function so it can run while
/// a piece entry is mutably borrowed out of the table.
fn free_slot(pool: &BufferPool, c: &mut Counters, pe: &mut CachedPiece, block: usize) {
    let state = pe.cache_state;
    let b = &mut pe.blocks[block];
    let Some(buf) = b.buf.take() else { return };
    debug_assert_eq!(b.refcount, 0, "freeing a pinned block");
    if b.dirty {
        b.dirty = false;
        pe.num_dirty -= 1;
        c.write_cache_size -= 1;
    } else {
        c.read_cache_size -= 1;
    }
    b.pending = false;
    b.cache_hit = false;
    if state == CacheState::Volatile {
        c.volatile_size -= 1;
    }
    pe.num_blocks -= 1;
    pool.free_buffer(buf);
}

pub struct BlockCache {
    pieces: HashMap<PieceKey, CachedPiece>,
    /// One list per [`CacheState`]; head is LRU, tail is MRU.
    lru: [LruList; CacheState::COUNT],
    last_cache_op: CacheOp,
    /// Entries each ghost list may hold before the oldest is erased.
    ghost_size: usize,
    max_volatile_blocks: usize,
    counters: Counters,
    settings: CacheSettings,
    pool: Arc<BufferPool>,
    /// Poked when the cache exceeds its block budget, so the surrounding
    /// scheduler can initiate flushes and evictions.
    trim: Arc<Notify>,
}

impl BlockCache {
    pub fn new(pool: Arc<BufferPool>, trim: Arc<Notify>) -> Self {
        let settings = CacheSettings::default();
        Self {
            pieces: HashMap::new(),
            lru: std::array::from_fn(|_| LruList::default()),
            last_cache_op: CacheOp::CacheMiss,
            ghost_size: settings.ghost_size(),
            max_volatile_blocks: settings.volatile_read_cache_size,
            counters: Counters::default(),
            settings,
            pool,
            trim,
        }
    }

    /// Applies new settings and shrinks the ghost lists if the new bound
    /// is tighter.
    pub fn set_settings(&mut self, settings: &CacheSettings) {
        self.settings = settings.clone();
        self.ghost_size = settings.ghost_size();
        self.max_volatile_blocks = settings.volatile_read_cache_size;
        for ghost in [CacheState::Read1Ghost, CacheState::Read2Ghost] {
            while self.lru[ghost as usize].len() > self.ghost_size {
                let Some(oldest) = self.lru[ghost as usize].front().copied() else {
                    break;
                };
                self.erase_piece_key(&oldest);
            }
        }
    }

    /// Current settings.
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Allocates a block buffer from the pool, evicting once to make room
    /// if the pool is exhausted. Returns `None` only after the retry also
    /// fails, in which case the trim trigger has been poked and the
    /// operation should fail back to its caller.
    pub fn allocate_buffer(&mut self) -> Option<BytesMut> {
        if let Some(buf) = self.pool.allocate_buffer() {
            return Some(buf);
        }
        self.try_evict_blocks(1, None);
        match self.pool.allocate_buffer() {
            Some(buf) => Some(buf),
            None => {
                self.trim.notify_waiters();
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookup and allocation
    // ------------------------------------------------------------------

    /// Looks up a resident piece (including ghosts).
    pub fn find_piece(&self, storage: &StorageHandle, piece: u32) -> Option<&CachedPiece> {
        self.pieces.get(&(storage.id(), piece))
    }

    /// Returns the piece entry for `(storage, piece)`, allocating an empty
    /// one on the `state` list if it is not resident.
    ///
    /// An existing entry is relinked only toward a more important list
    /// (ghost back to real, read to write); a ghost promotion records the
    /// corresponding ARC ghost hit.
    pub fn allocate_piece(
        &mut self,
        storage: &StorageHandle,
        piece: u32,
        state: CacheState,
    ) -> PieceKey {
        let key = (storage.id(), piece);
        if let Some(pe) = self.pieces.get_mut(&key) {
            // the piece is wanted again
            pe.marked_for_eviction = false;
            let cur = pe.cache_state;
            if (state as u8) < (cur as u8) {
                let mut target = state;
                if cur.is_ghost() {
                    match cur {
                        CacheState::Read1Ghost => self.last_cache_op = CacheOp::GhostHitLru1,
                        _ => self.last_cache_op = CacheOp::GhostHitLru2,
                    }
                    // a ghost resurrects on its own real list (a frequent
                    // piece stays frequent), unless it is being written to
                    if state != CacheState::Write {
                        target = cur.real();
                    }
                }
                self.set_piece_state(&key, target);
            }
            return key;
        }

        if !state.is_ghost() {
            self.last_cache_op = CacheOp::CacheMiss;
        }
        let expire = Instant::now() + self.settings.cache_expiry;
        trace!(storage = key.0, piece, ?state, "allocating piece entry");
        self.pieces
            .insert(key, CachedPiece::new(storage.clone(), piece, state, expire));
        self.lru[state as usize].push_back(key);
        key
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Serves a read job from the cache.
    ///
    /// On a hit, `alloc` provides the response buffer, the requested bytes
    /// are copied into it, and the filled buffer lands in `j.buf`. A piece
    /// that is entirely absent records a cache miss; a ghost entry records
    /// a ghost hit and is promoted back to its real list (its blocks must
    /// be read back by the caller). A resident piece missing some of the
    /// requested blocks is a plain miss for this job.
    pub fn try_read<A>(&mut self, j: &mut DiskJob, mut alloc: A) -> Result<usize, TryReadError>
    where
        A: FnMut(usize) -> Option<BytesMut>,
    {
        let key = j.key();
        let Some(pe) = self.pieces.get(&key) else {
            self.last_cache_op = CacheOp::CacheMiss;
            return Err(TryReadError::Miss);
        };

        if pe.cache_state.is_ghost() {
            self.last_cache_op = match pe.cache_state {
                CacheState::Read1Ghost => CacheOp::GhostHitLru1,
                _ => CacheOp::GhostHitLru2,
            };
            let real = pe.cache_state.real();
            if let Some(pe) = self.pieces.get_mut(&key) {
                // the entry is wanted again
                pe.marked_for_eviction = false;
            }
            self.set_piece_state(&key, real);
            return Err(TryReadError::Miss);
        }

        self.cache_hit_key(&key, j.block(), j.volatile_read);

        match self.copy_from_piece(&key, j, &mut alloc) {
            Err(TryReadError::Allocation) => {
                // make room and retry once
                self.try_evict_blocks(1, Some(&key));
                self.copy_from_piece(&key, j, &mut alloc)
            }
            r => r,
        }
    }

    /// Registers a hit on `block` of a resident piece and updates its LRU
    /// position: first hits refresh the current list, duplicate hits
    /// promote the piece to the frequent list. Volatile readers never
    /// promote a volatile piece.
    pub fn cache_hit(
        &mut self,
        storage: &StorageHandle,
        piece: u32,
        block: usize,
        volatile_read: bool,
    ) {
        self.cache_hit_key(&(storage.id(), piece), block, volatile_read);
    }

    fn cache_hit_key(&mut self, key: &PieceKey, block: usize, volatile_read: bool) {
        let Some(pe) = self.pieces.get_mut(key) else { return };
        // write-cache pieces stay on the write LRU no matter what
        if pe.cache_state == CacheState::Write {
            return;
        }
        let dup = pe.blocks.get(block).map_or(false, |b| b.cache_hit);
        let mut target = if dup {
            CacheState::Read2
        } else {
            pe.cache_state.real()
        };
        if volatile_read && pe.cache_state == CacheState::Volatile {
            // one-shot readers don't warm the cache
            target = CacheState::Volatile;
        }
        pe.expire = Instant::now() + self.settings.cache_expiry;
        let cur = pe.cache_state;
        if cur == target {
            self.lru[cur as usize].move_to_back(key);
        } else {
            self.set_piece_state(key, target);
        }
    }

    fn copy_from_piece<A>(
        &mut self,
        key: &PieceKey,
        j: &mut DiskJob,
        alloc: &mut A,
    ) -> Result<usize, TryReadError>
    where
        A: FnMut(usize) -> Option<BytesMut>,
    {
        let Some(pe) = self.pieces.get_mut(key) else {
            return Err(TryReadError::Miss);
        };
        let offset = j.offset as usize;
        let len = j.len as usize;
        if len == 0 {
            j.buf = Some(Bytes::new());
            return Ok(0);
        }
        let start = offset / BLOCK_SIZE;
        let end = (offset + len - 1) / BLOCK_SIZE;
        if end >= pe.blocks.len() {
            return Err(TryReadError::Miss);
        }

        // every touched block must be resident and valid before any
        // bytes are copied
        for i in start..=end {
            let b = &pe.blocks[i];
            let Some(buf) = &b.buf else {
                return Err(TryReadError::Miss);
            };
            if b.pending {
                return Err(TryReadError::Miss);
            }
            let block_start = i * BLOCK_SIZE;
            let need_end = (offset + len).min(block_start + BLOCK_SIZE);
            if block_start + buf.len() < need_end {
                return Err(TryReadError::Miss);
            }
        }

        let mut out = alloc(len).ok_or(TryReadError::Allocation)?;
        let mut pos = offset;
        let mut remaining = len;
        for i in start..=end {
            let b = &mut pe.blocks[i];
            let buf = b.buf.as_ref().expect("validated above");
            let in_block = pos - i * BLOCK_SIZE;
            let n = remaining.min(buf.len() - in_block);
            out.extend_from_slice(&buf[in_block..in_block + n]);
            b.cache_hit = true;
            pos += n;
            remaining -= n;
        }
        debug_assert_eq!(remaining, 0);
        j.buf = Some(out.freeze());
        Ok(len)
    }

    /// Number of blocks a read job would cause to be read in, including
    /// the read-ahead window, clipped to the end of the piece.
    pub fn pad_job(&self, j: &DiskJob, blocks_in_piece: usize, read_ahead: usize) -> usize {
        let block_offset = j.offset as usize & (BLOCK_SIZE - 1);
        let start = j.offset as usize / BLOCK_SIZE;
        if start >= blocks_in_piece {
            return 0;
        }
        let end = if block_offset > 0 && j.len as usize > BLOCK_SIZE - block_offset {
            start + 2
        } else {
            start + 1
        };
        let end = blocks_in_piece.min(end.max(start + read_ahead));
        end - start
    }

    /// Marks the start of a storage read on this piece. Returns false if
    /// one is already outstanding, in which case the new job should be
    /// deferred with [`defer_read`](Self::defer_read).
    pub fn try_begin_read(&mut self, storage: &StorageHandle, piece: u32) -> bool {
        let Some(pe) = self.pieces.get_mut(&(storage.id(), piece)) else {
            return false;
        };
        if pe.outstanding_read {
            return false;
        }
        pe.outstanding_read = true;
        true
    }

    /// Queues a read job behind the outstanding read on its piece. Gives
    /// the job back if there is nothing to wait for.
    pub fn defer_read(&mut self, j: DiskJob) -> Result<(), DiskJob> {
        match self.pieces.get_mut(&j.key()) {
            Some(pe) if pe.outstanding_read => {
                pe.read_jobs.push_back(j);
                Ok(())
            }
            _ => Err(j),
        }
    }

    /// Marks the outstanding read on this piece as finished and returns
    /// the deferred read jobs in arrival order, for the dispatcher to
    /// complete against the freshly inserted blocks.
    pub fn end_read(&mut self, storage: &StorageHandle, piece: u32) -> Vec<DiskJob> {
        let Some(pe) = self.pieces.get_mut(&(storage.id(), piece)) else {
            return Vec::new();
        };
        pe.outstanding_read = false;
        pe.read_jobs.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Attaches a write job's payload to its block slot as a dirty block
    /// and queues the job on the piece for completion when the block
    /// flushes. Ownership of the payload transfers to the cache.
    ///
    /// A live buffer already in the slot is superseded: it is freed and
    /// its queued job completes with [`JobError::Superseded`].
    pub fn add_dirty_block(&mut self, mut j: DiskJob) -> PieceKey {
        let buf = j.buf.take().expect("write job carries a payload");
        let key = self.allocate_piece(&j.storage, j.piece, CacheState::Write);
        let block = j.block();

        // stay within the block budget before attaching a new buffer
        let over = (self.in_use_blocks() + 1).saturating_sub(self.settings.cache_size);
        if over > 0 {
            self.try_evict_blocks(over, Some(&key));
        }

        let pe = self.pieces.get_mut(&key).expect("just allocated");
        assert!(block < pe.blocks.len(), "write past end of piece");
        if pe.blocks[block].buf.is_some() {
            assert_eq!(pe.blocks[block].refcount, 0, "overwriting a pinned block");
            if let Some(pos) = pe.jobs.iter().position(|q| q.block() == block) {
                if let Some(old) = pe.jobs.remove(pos) {
                    old.finish(Err(JobError::Superseded));
                }
            }
            free_slot(&self.pool, &mut self.counters, pe, block);
            debug!(storage = key.0, piece = key.1, block, "superseded dirty block");
        }

        let slot = &mut pe.blocks[block];
        slot.buf = Some(buf);
        slot.dirty = true;
        slot.pending = false;
        pe.num_blocks += 1;
        pe.num_dirty += 1;
        self.counters.write_cache_size += 1;
        pe.jobs.push_back(j);

        self.bump_lru_key(&key);
        if self.in_use_blocks() > self.settings.cache_size {
            self.trim.notify_waiters();
        }
        #[cfg(debug_assertions)]
        self.check_invariant();
        key
    }

    /// Inserts a contiguous run of read-back buffers starting at
    /// `first_block`. The piece must have been allocated. With
    /// `inc_refcount` each inserted block starts pinned once (the caller
    /// keeps a reference). Returns the number of blocks inserted.
    pub fn insert_blocks(
        &mut self,
        storage: &StorageHandle,
        piece: u32,
        first_block: usize,
        bufs: Vec<Bytes>,
        inc_refcount: bool,
    ) -> usize {
        let key = (storage.id(), piece);
        let n = bufs.len();
        if n == 0 {
            return 0;
        }
        let over = (self.in_use_blocks() + n).saturating_sub(self.settings.cache_size);
        if over > 0 {
            self.try_evict_blocks(over, Some(&key));
        }
        let expire = Instant::now() + self.settings.cache_expiry;
        let pe = self
            .pieces
            .get_mut(&key)
            .expect("insert_blocks requires an allocated piece");

        let volatile = pe.cache_state == CacheState::Volatile;
        let mut inserted = 0;
        for (i, buf) in bufs.into_iter().enumerate() {
            let block = first_block + i;
            assert!(block < pe.blocks.len(), "block run past end of piece");
            debug_assert!(!pe.blocks[block].dirty, "read-back over a dirty block");
            if pe.blocks[block].buf.is_some() {
                if pe.blocks[block].refcount > 0 {
                    // someone still holds the old buffer; keep it
                    self.pool.free_buffer(buf);
                    continue;
                }
                free_slot(&self.pool, &mut self.counters, pe, block);
            }
            let slot = &mut pe.blocks[block];
            slot.buf = Some(buf);
            slot.pending = false;
            pe.num_blocks += 1;
            self.counters.read_cache_size += 1;
            if volatile {
                self.counters.volatile_size += 1;
            }
            if inc_refcount {
                slot.refcount = 1;
                pe.pinned += 1;
                pe.refcount += 1;
                self.counters.pinned_blocks += 1;
                #[cfg(debug_assertions)]
                {
                    slot.reason_counts[Reason::Reading as usize] += 1;
                }
            }
            inserted += 1;
        }
        pe.expire = expire;

        if self.in_use_blocks() > self.settings.cache_size {
            self.trim.notify_waiters();
        }
        #[cfg(debug_assertions)]
        self.check_invariant();
        inserted
    }

    /// Marks the start of a flush on this piece. Returns false if a flush
    /// is already outstanding (no need to issue another).
    pub fn try_begin_flush(&mut self, storage: &StorageHandle, piece: u32) -> bool {
        let Some(pe) = self.pieces.get_mut(&(storage.id(), piece)) else {
            return false;
        };
        if pe.outstanding_flush {
            return false;
        }
        pe.outstanding_flush = true;
        true
    }

    /// Converts the given dirty blocks to clean read-cache blocks after
    /// the storage layer wrote them, completing their write jobs in
    /// arrival order. Returns true if this freed the piece entirely (it
    /// was marked for deletion and became evictable).
    pub fn blocks_flushed(
        &mut self,
        storage: &StorageHandle,
        piece: u32,
        flushed: &[usize],
    ) -> bool {
        let key = (storage.id(), piece);
        let Some(pe) = self.pieces.get_mut(&key) else {
            return false;
        };
        debug_assert!(usize::from(pe.num_dirty) >= flushed.len());

        for &block in flushed {
            let past_cursor = pe
                .hash
                .as_ref()
                .map_or(false, |h| (block * BLOCK_SIZE) as u32 >= h.offset);
            let b = &mut pe.blocks[block];
            debug_assert!(b.dirty && b.buf.is_some(), "flushed a non-dirty block");
            b.dirty = false;
            b.pending = false;
            if past_cursor {
                // flushed ahead of the hash cursor: hashing this piece
                // must now re-read those blocks from storage
                pe.need_readback = true;
            }
        }
        pe.num_dirty -= flushed.len() as u16;
        self.counters.write_cache_size -= flushed.len();
        self.counters.read_cache_size += flushed.len();
        pe.outstanding_flush = false;

        let mut kept = VecDeque::with_capacity(pe.jobs.len());
        for job in pe.jobs.drain(..) {
            if flushed.contains(&job.block()) {
                let bytes = job.len as usize;
                job.finish(Ok(bytes));
            } else {
                kept.push_back(job);
            }
        }
        pe.jobs = kept;

        self.update_cache_state_key(&key);
        let freed = self.maybe_free_piece_key(&key);
        #[cfg(debug_assertions)]
        self.check_invariant();
        freed
    }

    /// Frees all dirty blocks with no outstanding references, failing
    /// their queued write jobs. Used at shutdown and on write failure.
    pub fn abort_dirty(&mut self, storage: &StorageHandle, piece: u32) {
        let key = (storage.id(), piece);
        let Some(pe) = self.pieces.get_mut(&key) else { return };
        for block in 0..pe.blocks.len() {
            let b = &pe.blocks[block];
            if !b.dirty || b.refcount > 0 || b.buf.is_none() {
                continue;
            }
            free_slot(&self.pool, &mut self.counters, pe, block);
        }
        // write jobs whose block is no longer dirty will never flush
        let mut kept = VecDeque::new();
        for job in pe.jobs.drain(..) {
            if pe.blocks[job.block()].dirty {
                kept.push_back(job);
            } else {
                job.finish(Err(JobError::Cancelled));
            }
        }
        pe.jobs = kept;
        self.update_cache_state_key(&key);
        #[cfg(debug_assertions)]
        self.check_invariant();
    }

    // ------------------------------------------------------------------
    // Hashing
    // ------------------------------------------------------------------

    /// Ensures the piece carries hashing state (cursor at zero). A piece
    /// being hashed stays on the write list until the digest is taken.
    pub fn start_hash(&mut self, storage: &StorageHandle, piece: u32) {
        let key = (storage.id(), piece);
        let Some(pe) = self.pieces.get_mut(&key) else { return };
        if pe.hash.is_none() && !pe.hashing_done {
            pe.hash = Some(PartialHash::new(pe.storage.hash_version()));
            self.update_cache_state_key(&key);
        }
    }

    /// Advances the hash cursor over contiguous resident blocks, feeding
    /// them to the hash context. Stops at the first missing, pending or
    /// short block. Returns the new cursor offset in bytes.
    pub fn update_hash(&mut self, storage: &StorageHandle, piece: u32) -> u32 {
        let Some(pe) = self.pieces.get_mut(&(storage.id(), piece)) else {
            return 0;
        };
        let piece_len = pe.storage.piece_len(piece) as usize;
        let Some(hash) = pe.hash.as_mut() else { return 0 };
        while (hash.offset as usize) < piece_len {
            let block = hash.offset as usize / BLOCK_SIZE;
            let Some(b) = pe.blocks.get(block) else { break };
            let Some(buf) = &b.buf else { break };
            if b.pending {
                break;
            }
            let want = BLOCK_SIZE.min(piece_len - block * BLOCK_SIZE);
            if buf.len() < want {
                break;
            }
            hash.update(&buf[..want]);
        }
        hash.offset
    }

    /// Finalizes the hash once the cursor has covered the whole piece and
    /// returns the digest. Returns `None` while bytes are still missing.
    pub fn finish_hash(&mut self, storage: &StorageHandle, piece: u32) -> Option<Vec<u8>> {
        let key = (storage.id(), piece);
        let pe = self.pieces.get_mut(&key)?;
        let piece_len = pe.storage.piece_len(piece);
        if pe.hash.as_ref().map_or(true, |h| h.offset < piece_len) {
            return None;
        }
        let hash = pe.hash.take().expect("checked above");
        pe.hashing_done = true;
        pe.need_readback = false;
        let digest = hash.state.finalize();
        self.update_cache_state_key(&key);
        self.maybe_free_piece_key(&key);
        Some(digest)
    }

    /// Marks an asynchronous hash job as working on this piece. Returns
    /// false if one already is.
    pub fn begin_hash_job(&mut self, storage: &StorageHandle, piece: u32) -> bool {
        let Some(pe) = self.pieces.get_mut(&(storage.id(), piece)) else {
            return false;
        };
        if pe.hashing {
            return false;
        }
        pe.hashing = true;
        true
    }

    /// Clears the async-hash flag and frees the piece if it was waiting
    /// on the hash job to go away.
    pub fn end_hash_job(&mut self, storage: &StorageHandle, piece: u32) {
        let key = (storage.id(), piece);
        let Some(pe) = self.pieces.get_mut(&key) else { return };
        pe.hashing = false;
        self.maybe_free_piece_key(&key);
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    /// Pins a block's buffer. Returns false if the slot has no buffer or
    /// the buffer is not yet valid (pending).
    pub fn inc_block_refcount(
        &mut self,
        storage: &StorageHandle,
        piece: u32,
        block: usize,
        reason: Reason,
    ) -> bool {
        let Some(pe) = self.pieces.get_mut(&(storage.id(), piece)) else {
            return false;
        };
        let Some(b) = pe.blocks.get_mut(block) else {
            return false;
        };
        if b.buf.is_none() || b.pending {
            return false;
        }
        assert!(b.refcount < MAX_BLOCK_REFCOUNT, "block refcount overflow");
        b.refcount += 1;
        if b.refcount == 1 {
            pe.pinned += 1;
            self.counters.pinned_blocks += 1;
        }
        pe.refcount += 1;
        #[cfg(debug_assertions)]
        {
            b.reason_counts[reason as usize] += 1;
        }
        #[cfg(not(debug_assertions))]
        let _ = reason;
        true
    }

    /// Releases a pin taken with the same `reason`. Unpinning the last
    /// reference of a piece marked for eviction or deletion removes it.
    pub fn dec_block_refcount(
        &mut self,
        storage: &StorageHandle,
        piece: u32,
        block: usize,
        reason: Reason,
    ) {
        let key = (storage.id(), piece);
        let pe = self
            .pieces
            .get_mut(&key)
            .expect("dec_block_refcount on unknown piece");
        let b = pe.blocks.get_mut(block).expect("block out of range");
        assert!(b.refcount > 0, "block refcount underflow");
        #[cfg(debug_assertions)]
        {
            assert!(
                b.reason_counts[reason as usize] > 0,
                "mispaired refcount reason"
            );
            b.reason_counts[reason as usize] -= 1;
        }
        #[cfg(not(debug_assertions))]
        let _ = reason;
        b.refcount -= 1;
        if b.refcount == 0 {
            pe.pinned -= 1;
            self.counters.pinned_blocks -= 1;
        }
        pe.refcount -= 1;
        if pe.refcount == 0 && (pe.marked_for_deletion || pe.marked_for_eviction) {
            self.maybe_free_piece_key(&key);
        }
    }

    /// Pins a block for a peer's send buffer and returns a zero-copy view
    /// of its data. `None` if the block is absent or pending.
    pub fn pin_block_for_send(
        &mut self,
        storage: &StorageHandle,
        piece: u32,
        block: usize,
    ) -> Option<(BlockRef, Bytes)> {
        if !self.inc_block_refcount(storage, piece, block, Reason::Reading) {
            return None;
        }
        self.counters.send_buffer_blocks += 1;
        let pe = self
            .pieces
            .get(&(storage.id(), piece))
            .expect("pinned above");
        let data = pe.blocks[block].buf.clone().expect("pinned above");
        Some((
            BlockRef {
                storage: storage.clone(),
                piece,
                block,
            },
            data,
        ))
    }

    /// Returns a send-buffer pin.
    pub fn reclaim_block(&mut self, r: BlockRef) {
        self.counters.send_buffer_blocks -= 1;
        self.dec_block_refcount(&r.storage, r.piece, r.block, Reason::Reading);
    }

    /// Pins a whole piece against removal (a thread is holding it).
    /// Returns false if the piece is not resident.
    pub fn inc_piece_refcount(&mut self, storage: &StorageHandle, piece: u32) -> bool {
        let Some(pe) = self.pieces.get_mut(&(storage.id(), piece)) else {
            return false;
        };
        assert!(
            pe.piece_refcount < MAX_PIECE_REFCOUNT,
            "piece refcount overflow"
        );
        pe.piece_refcount += 1;
        true
    }

    /// Releases a piece pin; the last one may free a marked piece.
    pub fn dec_piece_refcount(&mut self, storage: &StorageHandle, piece: u32) {
        let key = (storage.id(), piece);
        let pe = self
            .pieces
            .get_mut(&key)
            .expect("dec_piece_refcount on unknown piece");
        assert!(pe.piece_refcount > 0, "piece refcount underflow");
        pe.piece_refcount -= 1;
        if pe.piece_refcount == 0 {
            self.maybe_free_piece_key(&key);
        }
    }

    // ------------------------------------------------------------------
    // Eviction and deletion
    // ------------------------------------------------------------------

    /// Frees a single unpinned block and fixes the derived counters.
    pub fn free_block(&mut self, storage: &StorageHandle, piece: u32, block: usize) {
        let Some(pe) = self.pieces.get_mut(&(storage.id(), piece)) else {
            return;
        };
        let Some(b) = pe.blocks.get(block) else { return };
        if b.refcount > 0 || b.pending {
            return;
        }
        free_slot(&self.pool, &mut self.counters, pe, block);
    }

    /// Marks the piece for removal. With [`EvictionMode::AllowGhost`] it
    /// is demoted to a ghost list once evictable; with
    /// [`EvictionMode::DisallowGhost`] it is erased. If the piece is
    /// already evictable it is removed immediately; any queued jobs fail
    /// with [`JobError::Cancelled`].
    pub fn mark_for_eviction(&mut self, storage: &StorageHandle, piece: u32, mode: EvictionMode) {
        let key = (storage.id(), piece);
        let Some(pe) = self.pieces.get_mut(&key) else { return };
        match mode {
            EvictionMode::DisallowGhost => pe.marked_for_deletion = true,
            EvictionMode::AllowGhost => pe.marked_for_eviction = true,
        }
        let mut jobs = Vec::new();
        self.evict_piece_key(&key, &mut jobs, mode);
        for job in jobs {
            job.finish(Err(JobError::Cancelled));
        }
        #[cfg(debug_assertions)]
        self.check_invariant();
    }

    /// Attempts to evict the piece right now: frees every unpinned block
    /// and, if nothing holds the piece, unlinks it (to a ghost list or
    /// entirely, per `mode`). Jobs hanging off the piece are appended to
    /// `jobs` for the caller to fail back to their originators. Returns
    /// true if the piece was removed.
    pub fn evict_piece(
        &mut self,
        storage: &StorageHandle,
        piece: u32,
        jobs: &mut Vec<DiskJob>,
        mode: EvictionMode,
    ) -> bool {
        self.evict_piece_key(&(storage.id(), piece), jobs, mode)
    }

    fn evict_piece_key(
        &mut self,
        key: &PieceKey,
        jobs: &mut Vec<DiskJob>,
        mode: EvictionMode,
    ) -> bool {
        let Some(pe) = self.pieces.get_mut(key) else { return false };
        for block in 0..pe.blocks.len() {
            let b = &pe.blocks[block];
            if b.buf.is_none() || b.refcount > 0 || b.pending {
                continue;
            }
            free_slot(&self.pool, &mut self.counters, pe, block);
        }
        if pe.ok_to_evict(true) && pe.num_blocks == 0 {
            pe.hash = None;
            jobs.extend(pe.jobs.drain(..));
            jobs.extend(pe.read_jobs.drain(..));
            let erase = mode == EvictionMode::DisallowGhost
                || pe.marked_for_deletion
                || pe.cache_state.ghost().is_none();
            if erase {
                self.erase_piece_key(key);
            } else {
                self.move_to_ghost_key(key);
            }
            return true;
        }
        false
    }

    /// Frees a marked piece once nothing holds it and no write jobs are
    /// queued. Returns true if the piece was removed.
    pub fn maybe_free_piece(&mut self, storage: &StorageHandle, piece: u32) -> bool {
        self.maybe_free_piece_key(&(storage.id(), piece))
    }

    fn maybe_free_piece_key(&mut self, key: &PieceKey) -> bool {
        let Some(pe) = self.pieces.get(key) else { return false };
        if !pe.ok_to_evict(false)
            || !(pe.marked_for_deletion || pe.marked_for_eviction)
            || !pe.jobs.is_empty()
        {
            return false;
        }
        let mode = if pe.marked_for_deletion {
            EvictionMode::DisallowGhost
        } else {
            EvictionMode::AllowGhost
        };
        let mut jobs = Vec::new();
        let freed = self.evict_piece_key(key, &mut jobs, mode);
        debug_assert!(jobs.is_empty());
        freed
    }

    /// Demotes a real read piece to its ghost list, draining any
    /// remaining buffers. Volatile and write pieces are erased instead;
    /// they leave no ghosts.
    pub fn move_to_ghost(&mut self, storage: &StorageHandle, piece: u32) {
        self.move_to_ghost_key(&(storage.id(), piece));
    }

    fn move_to_ghost_key(&mut self, key: &PieceKey) {
        let Some(pe) = self.pieces.get_mut(key) else { return };
        debug_assert_eq!(pe.refcount, 0);
        debug_assert_eq!(pe.piece_refcount, 0);
        for block in 0..pe.blocks.len() {
            if pe.blocks[block].buf.is_some() {
                free_slot(&self.pool, &mut self.counters, pe, block);
            }
        }
        debug_assert_eq!(pe.num_blocks, 0);
        let cur = pe.cache_state;
        let Some(ghost) = cur.ghost() else {
            self.erase_piece_key(key);
            return;
        };
        // bound the ghost list, dropping its oldest entries
        let g = ghost as usize;
        while self.lru[g].len() >= self.ghost_size {
            let Some(oldest) = self.lru[g].front().copied() else { break };
            trace!(
                storage = oldest.0,
                piece = oldest.1,
                "ghost list full, dropping oldest"
            );
            self.erase_piece_key(&oldest);
        }
        self.set_piece_state(key, ghost);
    }

    /// Terminal removal: frees buffers, unlinks from the LRU and the
    /// piece table.
    pub fn erase_piece(&mut self, storage: &StorageHandle, piece: u32) {
        self.erase_piece_key(&(storage.id(), piece));
    }

    fn erase_piece_key(&mut self, key: &PieceKey) {
        let Some(mut pe) = self.pieces.remove(key) else { return };
        debug_assert_eq!(pe.refcount, 0, "erasing a pinned piece");
        for block in 0..pe.blocks.len() {
            if pe.blocks[block].buf.is_some() {
                free_slot(&self.pool, &mut self.counters, &mut pe, block);
            }
        }
        self.lru[pe.cache_state as usize].remove(key);
        debug_assert!(pe.jobs.is_empty() && pe.read_jobs.is_empty());
        trace!(storage = key.0, piece = key.1, "erased piece");
    }

    /// Tries to free `num` read-cache blocks, least recently used first.
    /// Volatile pieces are drained before either real list; the ARC bias
    /// picks which real list goes next. Pinned blocks and the `ignore`
    /// piece are skipped. Returns how many blocks could *not* be evicted.
    pub fn try_evict_blocks(&mut self, num: usize, ignore: Option<&PieceKey>) -> usize {
        if num == 0 {
            return 0;
        }
        trace!(num, "evicting read blocks");
        let (preferred, fallback) = match self.last_cache_op {
            CacheOp::GhostHitLru1 => (CacheState::Read2, CacheState::Read1),
            _ => (CacheState::Read1, CacheState::Read2),
        };
        let mut remaining = num;
        for list in [CacheState::Volatile, preferred, fallback] {
            if remaining == 0 {
                break;
            }
            remaining = self.evict_from_list(list, remaining, ignore);
        }
        remaining
    }

    fn evict_from_list(
        &mut self,
        list: CacheState,
        mut num: usize,
        ignore: Option<&PieceKey>,
    ) -> usize {
        let keys: Vec<PieceKey> = self.lru[list as usize].iter().copied().collect();
        for key in keys {
            if num == 0 {
                break;
            }
            if ignore == Some(&key) {
                continue;
            }
            let Some(pe) = self.pieces.get_mut(&key) else { continue };
            if pe.cache_state != list {
                continue;
            }
            if pe.num_blocks == 0 && pe.ok_to_evict(false) {
                if pe.marked_for_deletion {
                    self.erase_piece_key(&key);
                } else {
                    self.move_to_ghost_key(&key);
                }
                continue;
            }
            for block in 0..pe.blocks.len() {
                if num == 0 {
                    break;
                }
                if !pe.blocks[block].evictable() {
                    continue;
                }
                free_slot(&self.pool, &mut self.counters, pe, block);
                num -= 1;
            }
            if pe.num_blocks == 0 && pe.ok_to_evict(false) {
                if pe.marked_for_deletion {
                    self.erase_piece_key(&key);
                } else {
                    self.move_to_ghost_key(&key);
                }
            }
        }
        num
    }

    /// Evicts a single volatile piece if the volatile list is over its
    /// cap: the least recently used piece that has any unpinned blocks is
    /// drained entirely and, once empty, erased (volatile pieces leave no
    /// ghosts). Fully pinned pieces are skipped.
    pub fn try_evict_one_volatile(&mut self) {
        if self.counters.volatile_size < self.max_volatile_blocks {
            return;
        }
        trace!("volatile cache full, evicting one piece");
        let keys: Vec<PieceKey> = self.lru[CacheState::Volatile as usize]
            .iter()
            .copied()
            .collect();
        for key in keys {
            let Some(pe) = self.pieces.get_mut(&key) else { continue };
            if pe.num_blocks == 0 && pe.ok_to_evict(false) {
                self.erase_piece_key(&key);
                continue;
            }
            let mut freed = 0;
            for block in 0..pe.blocks.len() {
                if !pe.blocks[block].evictable() {
                    continue;
                }
                free_slot(&self.pool, &mut self.counters, pe, block);
                freed += 1;
            }
            if pe.num_blocks == 0 && pe.ok_to_evict(false) {
                self.erase_piece_key(&key);
            }
            if freed > 0 {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // LRU maintenance
    // ------------------------------------------------------------------

    /// Moves a piece to the MRU end of its list and refreshes its expiry.
    /// Used to keep in-flight write pieces warm.
    pub fn bump_lru(&mut self, storage: &StorageHandle, piece: u32) {
        self.bump_lru_key(&(storage.id(), piece));
    }

    fn bump_lru_key(&mut self, key: &PieceKey) {
        if let Some(pe) = self.pieces.get_mut(key) {
            pe.expire = Instant::now() + self.settings.cache_expiry;
            let st = pe.cache_state as usize;
            self.lru[st].move_to_back(key);
        }
    }

    /// Recomputes which list the piece belongs on (dirty blocks or an
    /// active hash keep it on the write list; a drained write piece moves
    /// to the recent read list) and relinks it.
    pub fn update_cache_state(&mut self, storage: &StorageHandle, piece: u32) {
        self.update_cache_state_key(&(storage.id(), piece));
    }

    fn update_cache_state_key(&mut self, key: &PieceKey) {
        let Some(pe) = self.pieces.get(key) else { return };
        let cur = pe.cache_state;
        let desired = if pe.num_dirty > 0 || pe.hash.is_some() {
            CacheState::Write
        } else if cur == CacheState::Write {
            CacheState::Read1
        } else {
            cur
        };
        if desired != cur {
            self.set_piece_state(key, desired);
        }
    }

    /// Relinks a piece into `to`, keeping the volatile block counter
    /// consistent. The piece lands at the MRU end.
    fn set_piece_state(&mut self, key: &PieceKey, to: CacheState) {
        let Some(pe) = self.pieces.get_mut(key) else { return };
        let from = pe.cache_state;
        if from == to {
            return;
        }
        let n = usize::from(pe.num_blocks);
        pe.cache_state = to;
        if from == CacheState::Volatile {
            self.counters.volatile_size -= n;
        }
        if to == CacheState::Volatile {
            self.counters.volatile_size += n;
        }
        self.lru[from as usize].remove(key);
        self.lru[to as usize].push_back(*key);
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Drops every piece and buffer. Jobs that were still hanging off
    /// pieces are returned for the caller to fail back to their
    /// originators. Afterwards all counters are zero.
    pub fn clear(&mut self) -> Vec<DiskJob> {
        debug!(pieces = self.pieces.len(), "clearing block cache");
        let mut jobs = Vec::new();
        let keys: Vec<PieceKey> = self.pieces.keys().copied().collect();
        for key in keys {
            let mut pe = self.pieces.remove(&key).expect("key just listed");
            jobs.extend(pe.jobs.drain(..));
            jobs.extend(pe.read_jobs.drain(..));
            for b in pe.blocks.iter_mut() {
                if let Some(buf) = b.buf.take() {
                    self.pool.free_buffer(buf);
                }
            }
        }
        for l in self.lru.iter_mut() {
            l.clear();
        }
        self.counters = Counters::default();
        jobs
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Clean blocks resident in the cache.
    pub fn read_cache_size(&self) -> usize {
        self.counters.read_cache_size
    }

    /// Dirty blocks awaiting flush.
    pub fn write_cache_size(&self) -> usize {
        self.counters.write_cache_size
    }

    /// Blocks with at least one outstanding reference.
    pub fn pinned_blocks(&self) -> usize {
        self.counters.pinned_blocks
    }

    /// Total live block buffers owned by the cache.
    pub fn in_use_blocks(&self) -> usize {
        self.counters.read_cache_size + self.counters.write_cache_size
    }

    /// Nature of the most recent lookup.
    pub fn last_cache_op(&self) -> CacheOp {
        self.last_cache_op
    }

    /// Number of resident pieces, ghosts included.
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// All resident pieces, in no particular order.
    pub fn all_pieces(&self) -> impl Iterator<Item = &CachedPiece> {
        self.pieces.values()
    }

    /// Pieces on the write list, least recently used first.
    pub fn write_lru_pieces(&self) -> impl Iterator<Item = &CachedPiece> {
        self.lru[CacheState::Write as usize]
            .iter()
            .filter_map(|k| self.pieces.get(k))
    }

    /// Write pieces whose expiry has passed, LRU first; candidates for
    /// the external flush policy.
    pub fn expired_write_pieces(&self, now: Instant) -> Vec<PieceKey> {
        self.write_lru_pieces()
            .filter(|p| p.expire() <= now && p.num_dirty() > 0)
            .map(|p| p.key())
            .collect()
    }

    /// Counter snapshot for session statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            read_cache_size: self.counters.read_cache_size,
            write_cache_size: self.counters.write_cache_size,
            volatile_size: self.counters.volatile_size,
            pinned_blocks: self.counters.pinned_blocks,
            send_buffer_blocks: self.counters.send_buffer_blocks,
            num_pieces: self.pieces.len(),
            write_lru_pieces: self.lru[CacheState::Write as usize].len(),
            ghost1_pieces: self.lru[CacheState::Read1Ghost as usize].len(),
            ghost2_pieces: self.lru[CacheState::Read2Ghost as usize].len(),
            last_cache_op: self.last_cache_op,
        }
    }

    /// Validates every structural invariant of the cache. Runs after each
    /// state-changing operation in debug builds and from tests.
    #[cfg(any(test, debug_assertions))]
    pub fn check_invariant(&self) {
        let mut total_bufs = 0usize;
        let mut total_dirty = 0usize;
        let mut total_pinned = 0usize;
        let mut total_volatile = 0usize;

        for (key, pe) in &self.pieces {
            let mut sum_ref = 0u32;
            let mut pinned = 0u32;
            let mut bufs = 0usize;
            let mut dirty = 0usize;
            for b in pe.blocks.iter() {
                sum_ref += b.refcount;
                if b.refcount > 0 {
                    pinned += 1;
                    assert!(b.buf.is_some(), "pinned block without a buffer");
                }
                if b.buf.is_some() {
                    bufs += 1;
                }
                if b.dirty {
                    dirty += 1;
                    assert!(b.buf.is_some(), "dirty block without a buffer");
                }
                #[cfg(debug_assertions)]
                assert_eq!(
                    b.reason_counts.iter().sum::<u32>(),
                    b.refcount,
                    "reason subcounts disagree with refcount"
                );
            }
            assert_eq!(sum_ref, pe.refcount);
            assert_eq!(pinned, pe.pinned);
            assert_eq!(bufs, usize::from(pe.num_blocks));
            assert_eq!(dirty, usize::from(pe.num_dirty));
            if dirty > 0 {
                assert_eq!(pe.cache_state, CacheState::Write);
            }
            if pe.cache_state.is_ghost() {
                assert_eq!(bufs, 0, "ghost entry holding buffers");
            }
            for (i, l) in self.lru.iter().enumerate() {
                assert_eq!(
                    l.contains(key),
                    i == pe.cache_state as usize,
                    "piece linked into the wrong LRU list"
                );
            }
            if pe.cache_state == CacheState::Volatile {
                total_volatile += bufs;
            }
            total_bufs += bufs;
            total_dirty += dirty;
            total_pinned += pinned as usize;
        }

        assert_eq!(
            total_bufs,
            self.counters.read_cache_size + self.counters.write_cache_size
        );
        assert_eq!(total_dirty, self.counters.write_cache_size);
        assert_eq!(total_pinned, self.counters.pinned_blocks);
        assert_eq!(total_volatile, self.counters.volatile_size);
        let listed: usize = self.lru.iter().map(|l| l.len()).sum();
        assert_eq!(listed, self.pieces.len());
    }
}

/// A cache behind the disk mutex.
///
/// The cache itself is not internally synchronized; this wrapper is for
/// deployments where completion messages (hash workers, send paths) land
/// on other threads and need to call back in.
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<Mutex<BlockCache>>,
}

impl SharedCache {
    pub fn new(cache: BlockCache) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cache)),
        }
    }

    /// Runs `f` with the disk mutex held.
    pub fn with<R>(&self, f: impl FnOnce(&mut BlockCache) -> R) -> R {
        f(&mut self.inner.lock())
    }
}
