//! End-to-end cache behavior: the read and write paths, ARC promotion
//! and ghost bias, refcount pinning, hash-cursor maintenance and
//! shutdown, plus a randomized stress loop over the invariant checker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::{Digest, Sha1};
use tokio::sync::Notify;

use super::{BlockCache, BufferPool, CacheOp, CacheState, EvictionMode, Reason};
use crate::constants::BLOCK_SIZE;
use crate::error::{JobError, TryReadError};
use crate::job::DiskJob;
use crate::settings::CacheSettings;
use crate::storage::StorageHandle;

const PIECE_BLOCKS: usize = 16;

fn cache() -> BlockCache {
    BlockCache::new(BufferPool::new(8192), Arc::new(Notify::new()))
}

fn storage() -> StorageHandle {
    StorageHandle::new(
        (PIECE_BLOCKS * BLOCK_SIZE) as u32,
        (64 * PIECE_BLOCKS * BLOCK_SIZE) as u64,
    )
}

fn block_bytes(fill: u8) -> Bytes {
    Bytes::from(vec![fill; BLOCK_SIZE])
}

fn alloc(len: usize) -> Option<BytesMut> {
    Some(BytesMut::with_capacity(len))
}

/// Allocates a piece on read_lru1 and fills `n` blocks.
fn seed_read_piece(c: &mut BlockCache, st: &StorageHandle, piece: u32, n: usize) {
    c.allocate_piece(st, piece, CacheState::Read1);
    let bufs = (0..n).map(|b| block_bytes(b as u8)).collect();
    c.insert_blocks(st, piece, 0, bufs, false);
}

#[test]
fn test_cold_read_miss() {
    let mut c = cache();
    let st = storage();

    let mut j = DiskJob::read(st, 0, 0, BLOCK_SIZE as u32);
    assert_eq!(c.try_read(&mut j, alloc), Err(TryReadError::Miss));
    assert_eq!(c.last_cache_op(), CacheOp::CacheMiss);
    assert!(j.buf.is_none());
    c.check_invariant();
}

#[test]
fn test_hot_read_hit() {
    let mut c = cache();
    let st = storage();
    c.allocate_piece(&st, 0, CacheState::Read1);
    c.insert_blocks(&st, 0, 0, vec![block_bytes(0xAB)], false);

    let mut j = DiskJob::read(st.clone(), 0, 0, BLOCK_SIZE as u32);
    assert_eq!(c.try_read(&mut j, alloc), Ok(BLOCK_SIZE));

    let out = j.buf.expect("hit fills the job buffer");
    assert_eq!(out.len(), BLOCK_SIZE);
    assert!(out.iter().all(|&b| b == 0xAB));

    let pe = c.find_piece(&st, 0).unwrap();
    assert_eq!(pe.cache_state(), CacheState::Read1);
    assert_eq!(c.read_cache_size(), 1);
    c.check_invariant();
}

#[test]
fn test_second_hit_promotes_to_frequent() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 0, 1);

    let mut j = DiskJob::read(st.clone(), 0, 0, BLOCK_SIZE as u32);
    assert_eq!(c.try_read(&mut j, alloc), Ok(BLOCK_SIZE));
    assert_eq!(c.find_piece(&st, 0).unwrap().cache_state(), CacheState::Read1);

    let mut j = DiskJob::read(st.clone(), 0, 0, BLOCK_SIZE as u32);
    assert_eq!(c.try_read(&mut j, alloc), Ok(BLOCK_SIZE));
    assert_eq!(c.find_piece(&st, 0).unwrap().cache_state(), CacheState::Read2);
    c.check_invariant();
}

#[test]
fn test_multi_block_read_crosses_slots() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 2, PIECE_BLOCKS);

    // four blocks starting 100 bytes into block 2
    let offset = 2 * BLOCK_SIZE as u32 + 100;
    let len = 4 * BLOCK_SIZE as u32;
    let mut j = DiskJob::read(st.clone(), 2, offset, len);
    assert_eq!(c.try_read(&mut j, alloc), Ok(len as usize));

    let out = j.buf.unwrap();
    assert_eq!(out.len(), len as usize);
    // the copy respects block boundaries: first byte comes from block 2,
    // the byte at the first boundary from block 3
    assert_eq!(out[0], 2);
    assert_eq!(out[BLOCK_SIZE - 100], 3);
    c.check_invariant();
}

#[test]
fn test_partial_piece_is_a_miss() {
    let mut c = cache();
    let st = storage();
    // only block 0 is resident
    seed_read_piece(&mut c, &st, 1, 1);

    let mut j = DiskJob::read(st, 1, 0, 2 * BLOCK_SIZE as u32);
    assert_eq!(c.try_read(&mut j, alloc), Err(TryReadError::Miss));
    c.check_invariant();
}

#[test]
fn test_read_allocation_failure_surfaces() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 0, 1);

    let mut j = DiskJob::read(st, 0, 0, BLOCK_SIZE as u32);
    let r = c.try_read(&mut j, |_| None);
    assert_eq!(r, Err(TryReadError::Allocation));
    c.check_invariant();
}

#[test]
fn test_write_coalesce_then_flush() {
    let mut c = cache();
    let st = storage();

    let mut rxs = Vec::new();
    for b in 0..4u32 {
        let mut j = DiskJob::write(st.clone(), 5, b * BLOCK_SIZE as u32, block_bytes(b as u8));
        rxs.push(j.subscribe());
        c.add_dirty_block(j);
    }

    let pe = c.find_piece(&st, 5).unwrap();
    assert_eq!(pe.cache_state(), CacheState::Write);
    assert_eq!(pe.num_dirty(), 4);
    assert_eq!(pe.num_blocks(), 4);
    assert_eq!(c.write_cache_size(), 4);
    assert_eq!(c.read_cache_size(), 0);

    let freed = c.blocks_flushed(&st, 5, &[0, 1, 2, 3]);
    assert!(!freed);

    let pe = c.find_piece(&st, 5).unwrap();
    assert_eq!(pe.num_dirty(), 0);
    assert_eq!(pe.num_blocks(), 4);
    assert_ne!(pe.cache_state(), CacheState::Write);
    assert_eq!(c.write_cache_size(), 0);
    assert_eq!(c.read_cache_size(), 4);

    // the write jobs completed in order
    for mut rx in rxs {
        assert_eq!(rx.try_recv().unwrap(), Ok(BLOCK_SIZE));
    }
    c.check_invariant();
}

#[test]
fn test_duplicate_write_supersedes_older_job() {
    let mut c = cache();
    let st = storage();

    let mut first = DiskJob::write(st.clone(), 0, 0, block_bytes(1));
    let mut rx1 = first.subscribe();
    c.add_dirty_block(first);

    let mut second = DiskJob::write(st.clone(), 0, 0, block_bytes(2));
    let mut rx2 = second.subscribe();
    c.add_dirty_block(second);

    assert_eq!(rx1.try_recv().unwrap(), Err(JobError::Superseded));
    assert_eq!(c.find_piece(&st, 0).unwrap().num_dirty(), 1);
    assert_eq!(c.write_cache_size(), 1);

    c.blocks_flushed(&st, 0, &[0]);
    assert_eq!(rx2.try_recv().unwrap(), Ok(BLOCK_SIZE));

    // the surviving block carries the newer payload
    let mut j = DiskJob::read(st, 0, 0, BLOCK_SIZE as u32);
    assert_eq!(c.try_read(&mut j, alloc), Ok(BLOCK_SIZE));
    assert_eq!(j.buf.unwrap()[0], 2);
    c.check_invariant();
}

#[test]
fn test_ghost_hit_flips_arc_bias() {
    let mut c = cache();
    let st = storage();

    // piece 1 promoted to the frequent list, piece 2 on the recent list
    seed_read_piece(&mut c, &st, 1, 1);
    for _ in 0..2 {
        let mut j = DiskJob::read(st.clone(), 1, 0, BLOCK_SIZE as u32);
        c.try_read(&mut j, alloc).unwrap();
    }
    assert_eq!(c.find_piece(&st, 1).unwrap().cache_state(), CacheState::Read2);
    seed_read_piece(&mut c, &st, 2, 1);

    // piece 0 evicted to the ghost list
    seed_read_piece(&mut c, &st, 0, 1);
    c.mark_for_eviction(&st, 0, EvictionMode::AllowGhost);
    let pe = c.find_piece(&st, 0).unwrap();
    assert_eq!(pe.cache_state(), CacheState::Read1Ghost);
    assert_eq!(pe.num_blocks(), 0);

    // reading the ghost is a miss that records the ghost hit and
    // resurrects the entry on its real list
    let mut j = DiskJob::read(st.clone(), 0, 0, BLOCK_SIZE as u32);
    assert_eq!(c.try_read(&mut j, alloc), Err(TryReadError::Miss));
    assert_eq!(c.last_cache_op(), CacheOp::GhostHitLru1);
    assert_eq!(c.find_piece(&st, 0).unwrap().cache_state(), CacheState::Read1);

    // with the bias flipped, eviction drains the frequent list first
    assert_eq!(c.try_evict_blocks(1, None), 0);
    let pe1 = c.find_piece(&st, 1).unwrap();
    assert_eq!(pe1.num_blocks(), 0);
    assert_eq!(pe1.cache_state(), CacheState::Read2Ghost);
    assert!(c.find_piece(&st, 2).unwrap().block_present(0));
    c.check_invariant();
}

#[test]
fn test_ghost_promotion_via_allocate() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 4, 1);
    c.mark_for_eviction(&st, 4, EvictionMode::AllowGhost);
    assert!(c.find_piece(&st, 4).unwrap().cache_state().is_ghost());

    c.allocate_piece(&st, 4, CacheState::Read1);
    assert_eq!(c.last_cache_op(), CacheOp::GhostHitLru1);
    assert_eq!(c.find_piece(&st, 4).unwrap().cache_state(), CacheState::Read1);
    c.check_invariant();
}

#[test]
fn test_frequent_ghost_resurrects_as_frequent() {
    let mut c = cache();
    let st = storage();
    // promote piece 5 to the frequent list, then evict it to its ghost
    seed_read_piece(&mut c, &st, 5, 1);
    for _ in 0..2 {
        let mut j = DiskJob::read(st.clone(), 5, 0, BLOCK_SIZE as u32);
        c.try_read(&mut j, alloc).unwrap();
    }
    c.mark_for_eviction(&st, 5, EvictionMode::AllowGhost);
    assert_eq!(
        c.find_piece(&st, 5).unwrap().cache_state(),
        CacheState::Read2Ghost
    );

    // a plain read allocation must not demote it to the recent list
    c.allocate_piece(&st, 5, CacheState::Read1);
    assert_eq!(c.last_cache_op(), CacheOp::GhostHitLru2);
    assert_eq!(c.find_piece(&st, 5).unwrap().cache_state(), CacheState::Read2);
    c.check_invariant();
}

#[test]
fn test_ghost_written_to_lands_on_write_list() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 5, 1);
    for _ in 0..2 {
        let mut j = DiskJob::read(st.clone(), 5, 0, BLOCK_SIZE as u32);
        c.try_read(&mut j, alloc).unwrap();
    }
    c.mark_for_eviction(&st, 5, EvictionMode::AllowGhost);

    c.add_dirty_block(DiskJob::write(st.clone(), 5, 0, block_bytes(9)));
    assert_eq!(c.last_cache_op(), CacheOp::GhostHitLru2);
    let pe = c.find_piece(&st, 5).unwrap();
    assert_eq!(pe.cache_state(), CacheState::Write);
    assert_eq!(pe.num_dirty(), 1);
    c.check_invariant();
}

#[test]
fn test_pinned_block_survives_eviction() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 7, PIECE_BLOCKS);

    assert!(c.inc_block_refcount(&st, 7, 0, Reason::Reading));
    assert_eq!(c.pinned_blocks(), 1);

    let remaining = c.try_evict_blocks(PIECE_BLOCKS, None);
    assert!(remaining >= 1, "the pinned block cannot be evicted");

    let pe = c.find_piece(&st, 7).unwrap();
    assert!(pe.block_present(0));
    assert_eq!(pe.pinned(), 1);

    c.dec_block_refcount(&st, 7, 0, Reason::Reading);
    assert_eq!(c.pinned_blocks(), 0);
    c.check_invariant();
}

#[test]
fn test_refcount_round_trip_restores_counts() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 0, 2);

    let before = c.find_piece(&st, 0).unwrap().refcount();
    assert!(c.inc_block_refcount(&st, 0, 1, Reason::Hashing));
    assert_eq!(c.find_piece(&st, 0).unwrap().refcount(), before + 1);
    assert_eq!(c.find_piece(&st, 0).unwrap().pinned(), 1);

    c.dec_block_refcount(&st, 0, 1, Reason::Hashing);
    assert_eq!(c.find_piece(&st, 0).unwrap().refcount(), before);
    assert_eq!(c.find_piece(&st, 0).unwrap().pinned(), 0);
    c.check_invariant();
}

#[test]
fn test_refcount_refuses_missing_or_pending_blocks() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 0, 1);

    // no buffer in slot 5
    assert!(!c.inc_block_refcount(&st, 0, 5, Reason::Reading));
    // out of range
    assert!(!c.inc_block_refcount(&st, 0, 99, Reason::Reading));
    // unknown piece
    assert!(!c.inc_block_refcount(&st, 9, 0, Reason::Reading));
}

#[test]
#[should_panic(expected = "block refcount underflow")]
fn test_refcount_underflow_is_fatal() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 0, 1);
    c.dec_block_refcount(&st, 0, 0, Reason::Reading);
}

#[test]
fn test_pin_for_send_and_reclaim() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 3, 1);

    let (r, data) = c.pin_block_for_send(&st, 3, 0).expect("block is resident");
    assert_eq!(data.len(), BLOCK_SIZE);
    assert_eq!(c.stats().send_buffer_blocks, 1);
    assert_eq!(c.find_piece(&st, 3).unwrap().block_refcount(0), 1);

    // pinned: eviction cannot take it
    assert_eq!(c.try_evict_blocks(1, None), 1);
    assert!(c.find_piece(&st, 3).unwrap().block_present(0));

    c.reclaim_block(r);
    assert_eq!(c.stats().send_buffer_blocks, 0);
    assert_eq!(c.find_piece(&st, 3).unwrap().block_refcount(0), 0);
    drop(data);
    c.check_invariant();
}

#[test]
fn test_delete_waits_for_pins() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 6, 1);
    assert!(c.inc_block_refcount(&st, 6, 0, Reason::Flushing));

    let mut jobs = Vec::new();
    assert!(!c.evict_piece(&st, 6, &mut jobs, EvictionMode::DisallowGhost));
    c.mark_for_eviction(&st, 6, EvictionMode::DisallowGhost);
    assert!(c.find_piece(&st, 6).is_some(), "pinned piece stays");

    // dropping the last pin frees the marked piece
    c.dec_block_refcount(&st, 6, 0, Reason::Flushing);
    assert!(c.find_piece(&st, 6).is_none());
    assert_eq!(c.pinned_blocks(), 0);
    c.check_invariant();
}

#[test]
fn test_piece_refcount_blocks_removal() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 2, 1);

    assert!(c.inc_piece_refcount(&st, 2));
    c.mark_for_eviction(&st, 2, EvictionMode::AllowGhost);
    assert!(c.find_piece(&st, 2).is_some());

    c.dec_piece_refcount(&st, 2);
    // demoted to a ghost once the holder let go
    assert!(c.find_piece(&st, 2).unwrap().cache_state().is_ghost());
    c.check_invariant();
}

#[test]
fn test_volatile_pieces_evicted_first_and_leave_no_ghost() {
    let mut c = cache();
    let st = storage();

    c.allocate_piece(&st, 10, CacheState::Volatile);
    c.insert_blocks(&st, 10, 0, vec![block_bytes(1)], false);
    seed_read_piece(&mut c, &st, 11, 1);
    assert_eq!(c.stats().volatile_size, 1);

    assert_eq!(c.try_evict_blocks(1, None), 0);
    // the volatile piece went first, and it is gone entirely
    assert!(c.find_piece(&st, 10).is_none());
    assert!(c.find_piece(&st, 11).unwrap().block_present(0));
    assert_eq!(c.stats().volatile_size, 0);
    c.check_invariant();
}

#[test]
fn test_volatile_cap_evicts_one_whole_piece() {
    let mut c = cache();
    let st = storage();
    let mut s = CacheSettings::default();
    s.volatile_read_cache_size = 1;
    c.set_settings(&s);

    c.allocate_piece(&st, 10, CacheState::Volatile);
    c.insert_blocks(&st, 10, 0, vec![block_bytes(1), block_bytes(2)], false);
    c.allocate_piece(&st, 11, CacheState::Volatile);
    c.insert_blocks(&st, 11, 0, vec![block_bytes(3)], false);
    assert_eq!(c.stats().volatile_size, 3);

    // the LRU volatile piece is drained entirely and erased; the
    // younger piece is untouched
    c.try_evict_one_volatile();
    assert!(c.find_piece(&st, 10).is_none());
    assert!(c.find_piece(&st, 11).unwrap().block_present(0));
    assert_eq!(c.stats().volatile_size, 1);
    c.check_invariant();
}

#[test]
fn test_volatile_eviction_skips_fully_pinned_piece() {
    let mut c = cache();
    let st = storage();
    let mut s = CacheSettings::default();
    s.volatile_read_cache_size = 1;
    c.set_settings(&s);

    c.allocate_piece(&st, 10, CacheState::Volatile);
    c.insert_blocks(&st, 10, 0, vec![block_bytes(1)], false);
    assert!(c.inc_block_refcount(&st, 10, 0, Reason::Reading));
    c.allocate_piece(&st, 11, CacheState::Volatile);
    c.insert_blocks(&st, 11, 0, vec![block_bytes(2)], false);

    c.try_evict_one_volatile();
    // the pinned piece yields nothing; the next one goes instead
    assert!(c.find_piece(&st, 10).unwrap().block_present(0));
    assert!(c.find_piece(&st, 11).is_none());
    assert_eq!(c.stats().volatile_size, 1);

    c.dec_block_refcount(&st, 10, 0, Reason::Reading);
    c.check_invariant();
}

#[test]
fn test_ghost_lists_are_bounded() {
    let mut c = cache();
    let st = storage();
    let mut s = CacheSettings::default();
    s.cache_size = 64; // ghost bound floors at MIN_GHOST_PIECES
    c.set_settings(&s);

    for piece in 0..12u32 {
        seed_read_piece(&mut c, &st, piece, 1);
        c.mark_for_eviction(&st, piece, EvictionMode::AllowGhost);
    }
    assert!(c.stats().ghost1_pieces <= crate::constants::MIN_GHOST_PIECES);
    c.check_invariant();
}

#[test]
fn test_free_block_skips_pinned_slots() {
    let mut c = cache();
    let st = storage();
    seed_read_piece(&mut c, &st, 0, 2);
    assert!(c.inc_block_refcount(&st, 0, 0, Reason::Reading));

    c.free_block(&st, 0, 0);
    assert!(c.find_piece(&st, 0).unwrap().block_present(0), "pinned");

    c.free_block(&st, 0, 1);
    assert!(!c.find_piece(&st, 0).unwrap().block_present(1));
    assert_eq!(c.read_cache_size(), 1);

    c.dec_block_refcount(&st, 0, 0, Reason::Reading);
    c.check_invariant();
}

#[test]
fn test_deferred_reads_complete_in_arrival_order() {
    let mut c = cache();
    let st = storage();
    c.allocate_piece(&st, 0, CacheState::Read1);

    assert!(c.try_begin_read(&st, 0));
    assert!(!c.try_begin_read(&st, 0), "read already outstanding");

    let j1 = DiskJob::read(st.clone(), 0, 0, BLOCK_SIZE as u32);
    let j2 = DiskJob::read(st.clone(), 0, BLOCK_SIZE as u32, BLOCK_SIZE as u32);
    assert!(c.defer_read(j1).is_ok());
    assert!(c.defer_read(j2).is_ok());

    let deferred = c.end_read(&st, 0);
    assert_eq!(deferred.len(), 2);
    assert_eq!(deferred[0].offset, 0);
    assert_eq!(deferred[1].offset, BLOCK_SIZE as u32);

    // nothing outstanding anymore: deferral hands the job back
    let j3 = DiskJob::read(st, 0, 0, BLOCK_SIZE as u32);
    assert!(c.defer_read(j3).is_err());
    c.check_invariant();
}

#[test]
fn test_hash_cursor_covers_whole_piece() {
    let mut c = cache();
    let st = storage();

    let mut expected = Sha1::new();
    for b in 0..PIECE_BLOCKS {
        let data = block_bytes(b as u8);
        expected.update(&data);
        c.add_dirty_block(DiskJob::write(
            st.clone(),
            0,
            (b * BLOCK_SIZE) as u32,
            data,
        ));
    }
    c.start_hash(&st, 0);
    assert!(c.finish_hash(&st, 0).is_none(), "cursor has not advanced yet");

    let advanced = c.update_hash(&st, 0);
    assert_eq!(advanced as usize, PIECE_BLOCKS * BLOCK_SIZE);

    let digest = c.finish_hash(&st, 0).expect("piece fully hashed");
    assert_eq!(digest, expected.finalize().to_vec());
    assert!(c.find_piece(&st, 0).unwrap().hashing_done());
    c.check_invariant();
}

#[test]
fn test_hash_cursor_stops_at_gap() {
    let mut c = cache();
    let st = storage();
    c.add_dirty_block(DiskJob::write(st.clone(), 0, 0, block_bytes(0)));
    // block 1 missing, block 2 present
    c.add_dirty_block(DiskJob::write(
        st.clone(),
        0,
        2 * BLOCK_SIZE as u32,
        block_bytes(2),
    ));
    c.start_hash(&st, 0);

    assert_eq!(c.update_hash(&st, 0) as usize, BLOCK_SIZE);
    assert!(c.finish_hash(&st, 0).is_none());
    c.check_invariant();
}

#[test]
fn test_flush_past_cursor_sets_need_readback() {
    let mut c = cache();
    let st = storage();
    c.add_dirty_block(DiskJob::write(st.clone(), 0, 0, block_bytes(0)));
    c.add_dirty_block(DiskJob::write(st.clone(), 0, BLOCK_SIZE as u32, block_bytes(1)));
    c.add_dirty_block(DiskJob::write(
        st.clone(),
        0,
        3 * BLOCK_SIZE as u32,
        block_bytes(3),
    ));
    c.start_hash(&st, 0);
    assert_eq!(c.update_hash(&st, 0) as usize, 2 * BLOCK_SIZE);
    assert!(!c.find_piece(&st, 0).unwrap().need_readback());

    // block 3 flushes ahead of the cursor
    c.blocks_flushed(&st, 0, &[3]);
    assert!(c.find_piece(&st, 0).unwrap().need_readback());

    // flushing already-hashed blocks does not
    c.blocks_flushed(&st, 0, &[0, 1]);
    c.check_invariant();
}

#[test]
fn test_hash_keeps_piece_on_write_list() {
    let mut c = cache();
    let st = storage();
    c.add_dirty_block(DiskJob::write(st.clone(), 0, 0, block_bytes(0)));
    c.start_hash(&st, 0);
    c.update_hash(&st, 0);

    c.blocks_flushed(&st, 0, &[0]);
    // no dirty blocks left, but the live hash pins it to the write list
    assert_eq!(c.find_piece(&st, 0).unwrap().cache_state(), CacheState::Write);
    assert_eq!(
        c.find_piece(&st, 0).unwrap().hash_offset(),
        Some(BLOCK_SIZE as u32)
    );
    c.check_invariant();
}

#[test]
fn test_abort_dirty_frees_blocks_and_fails_jobs() {
    let mut c = cache();
    let st = storage();
    let mut j = DiskJob::write(st.clone(), 0, 0, block_bytes(0));
    let mut rx = j.subscribe();
    c.add_dirty_block(j);

    c.abort_dirty(&st, 0);
    assert_eq!(rx.try_recv().unwrap(), Err(JobError::Cancelled));
    assert_eq!(c.write_cache_size(), 0);
    assert_eq!(c.find_piece(&st, 0).unwrap().num_blocks(), 0);
    c.check_invariant();
}

#[test]
fn test_clear_returns_hanging_jobs_and_zeroes_counters() {
    let mut c = cache();
    let st = storage();
    let mut j = DiskJob::write(st.clone(), 0, 0, block_bytes(0));
    let mut rx = j.subscribe();
    c.add_dirty_block(j);
    seed_read_piece(&mut c, &st, 1, 3);
    assert!(c.try_begin_read(&st, 1));
    c.defer_read(DiskJob::read(st.clone(), 1, 0, BLOCK_SIZE as u32))
        .unwrap();

    let jobs = c.clear();
    assert_eq!(jobs.len(), 2);
    for job in jobs {
        job.finish(Err(JobError::Cancelled));
    }
    assert_eq!(rx.try_recv().unwrap(), Err(JobError::Cancelled));

    assert_eq!(c.num_pieces(), 0);
    assert_eq!(c.in_use_blocks(), 0);
    assert_eq!(c.pinned_blocks(), 0);
    c.check_invariant();
}

#[test]
fn test_expired_write_pieces_listed_lru_first() {
    let mut c = cache();
    let st = storage();
    let mut s = CacheSettings::default();
    s.cache_expiry = Duration::ZERO;
    c.set_settings(&s);

    c.add_dirty_block(DiskJob::write(st.clone(), 0, 0, block_bytes(0)));
    c.add_dirty_block(DiskJob::write(st.clone(), 1, 0, block_bytes(1)));

    let expired = c.expired_write_pieces(Instant::now() + Duration::from_millis(1));
    assert_eq!(expired.len(), 2);
    assert_eq!(expired[0].1, 0);
    assert_eq!(expired[1].1, 1);
}

#[test]
fn test_allocate_buffer_evicts_to_make_room() {
    // a pool with a single buffer, held by a resident cache block
    let pool = BufferPool::new(1);
    let mut c = BlockCache::new(pool.clone(), Arc::new(Notify::new()));
    let st = storage();

    let buf = pool.allocate_buffer().unwrap();
    c.allocate_piece(&st, 0, CacheState::Read1);
    c.insert_blocks(&st, 0, 0, vec![buf.freeze()], false);

    // the pool is exhausted, but evicting the cache block frees it
    let again = c.allocate_buffer();
    assert!(again.is_some());
    assert_eq!(c.find_piece(&st, 0).unwrap().num_blocks(), 0);
    c.check_invariant();
}

#[test]
fn test_stats_snapshot() {
    let mut c = cache();
    let st = storage();
    c.add_dirty_block(DiskJob::write(st.clone(), 0, 0, block_bytes(0)));
    seed_read_piece(&mut c, &st, 1, 2);

    let s = c.stats();
    assert_eq!(s.write_cache_size, 1);
    assert_eq!(s.read_cache_size, 2);
    assert_eq!(s.num_pieces, 2);
    assert_eq!(s.write_lru_pieces, 1);
}

#[test]
fn test_random_ops_hold_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut c = cache();
    let st = storage();
    let mut pins: Vec<(u32, usize)> = Vec::new();

    for _ in 0..2000 {
        let piece = rng.gen_range(0..8u32);
        match rng.gen_range(0..8) {
            0 => {
                let block = rng.gen_range(0..PIECE_BLOCKS);
                let pinned = c
                    .find_piece(&st, piece)
                    .map_or(false, |p| p.block_refcount(block) > 0);
                if !pinned {
                    c.add_dirty_block(DiskJob::write(
                        st.clone(),
                        piece,
                        (block * BLOCK_SIZE) as u32,
                        block_bytes(rng.gen()),
                    ));
                }
            }
            1 => {
                if let Some(pe) = c.find_piece(&st, piece) {
                    let dirty: Vec<usize> =
                        (0..PIECE_BLOCKS).filter(|&b| pe.block_dirty(b)).collect();
                    if !dirty.is_empty() {
                        c.blocks_flushed(&st, piece, &dirty);
                    }
                }
            }
            2 => {
                let block = rng.gen_range(0..PIECE_BLOCKS);
                let mut j = DiskJob::read(
                    st.clone(),
                    piece,
                    (block * BLOCK_SIZE) as u32,
                    BLOCK_SIZE as u32,
                );
                let _ = c.try_read(&mut j, alloc);
            }
            3 => {
                let block = rng.gen_range(0..PIECE_BLOCKS);
                let dirty = c
                    .find_piece(&st, piece)
                    .map_or(false, |p| p.block_dirty(block));
                if !dirty {
                    c.allocate_piece(&st, piece, CacheState::Read1);
                    c.insert_blocks(&st, piece, block, vec![block_bytes(rng.gen())], false);
                }
            }
            4 => {
                c.try_evict_blocks(rng.gen_range(1..8), None);
            }
            5 => {
                let block = rng.gen_range(0..PIECE_BLOCKS);
                if c.inc_block_refcount(&st, piece, block, Reason::Reading) {
                    pins.push((piece, block));
                }
            }
            6 => {
                if let Some((p, b)) = pins.pop() {
                    c.dec_block_refcount(&st, p, b, Reason::Reading);
                }
            }
            _ => {
                let has_jobs = c
                    .find_piece(&st, piece)
                    .map_or(false, |p| p.num_dirty() > 0);
                if !has_jobs {
                    c.mark_for_eviction(&st, piece, EvictionMode::AllowGhost);
                }
            }
        }
        c.check_invariant();
    }

    for (p, b) in pins.drain(..) {
        c.dec_block_refcount(&st, p, b, Reason::Reading);
    }
    c.check_invariant();
    c.clear();
    assert_eq!(c.in_use_blocks(), 0);
}
