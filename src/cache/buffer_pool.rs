//! Block buffer pool.
//!
//! Fixed-size 16 KiB buffers with a hard cap on how many may be live at
//! once. Allocation fails (rather than blocking) when the cap is reached;
//! the cache reacts by evicting and retrying. Freed buffers are recycled
//! through a lock-free queue when their `Bytes` handle is the last one
//! standing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;

use crate::constants::{BLOCK_SIZE, DEFAULT_POOL_BLOCKS};

pub struct BufferPool {
    free: ArrayQueue<BytesMut>,
    in_use: AtomicUsize,
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool allowing up to `capacity` live block buffers.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(capacity.max(1)),
            in_use: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Allocates one writable block buffer, or `None` if the pool is
    /// exhausted.
    pub fn allocate_buffer(&self) -> Option<BytesMut> {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Some(
            self.free
                .pop()
                .unwrap_or_else(|| BytesMut::with_capacity(BLOCK_SIZE)),
        )
    }

    /// Returns a buffer to the pool. The storage is recycled only if no
    /// other `Bytes` handle still references it; a correctly refcounted
    /// block has none by the time it is freed. Buffers that did not come
    /// from this pool are absorbed without driving the counter negative.
    pub fn free_buffer(&self, buf: Bytes) {
        let _ = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |v| v.checked_sub(1));
        if let Ok(mut owned) = buf.try_into_mut() {
            owned.clear();
            let _ = self.free.push(owned);
        }
    }

    /// Same as [`free_buffer`](Self::free_buffer) for a buffer that was
    /// never frozen.
    pub fn free_buffer_mut(&self, mut buf: BytesMut) {
        let _ = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |v| v.checked_sub(1));
        buf.clear();
        let _ = self.free.push(buf);
    }

    /// Number of buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Maximum number of live buffers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            free: ArrayQueue::new(DEFAULT_POOL_BLOCKS),
            in_use: AtomicUsize::new(0),
            capacity: DEFAULT_POOL_BLOCKS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion() {
        let pool = BufferPool::new(2);

        let a = pool.allocate_buffer().unwrap();
        let b = pool.allocate_buffer().unwrap();
        assert!(pool.allocate_buffer().is_none());
        assert_eq!(pool.in_use(), 2);

        pool.free_buffer_mut(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.allocate_buffer().is_some());
        drop(b);
    }

    #[test]
    fn test_pool_recycles_unique_buffers() {
        let pool = BufferPool::new(4);

        let mut buf = pool.allocate_buffer().unwrap();
        buf.extend_from_slice(&[1u8; 64]);
        pool.free_buffer(buf.freeze());
        assert_eq!(pool.in_use(), 0);

        // the recycled buffer comes back empty
        let again = pool.allocate_buffer().unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_pool_drops_shared_buffers() {
        let pool = BufferPool::new(4);

        let mut buf = pool.allocate_buffer().unwrap();
        buf.extend_from_slice(&[2u8; 64]);
        let frozen = buf.freeze();
        let extra = frozen.clone();

        // still referenced elsewhere: accounted as freed, not recycled
        pool.free_buffer(frozen);
        assert_eq!(pool.in_use(), 0);
        drop(extra);
    }
}
