//! Disk job descriptors.
//!
//! A [`DiskJob`] names one piece-aligned I/O operation. Jobs flow from the
//! dispatcher into the cache; the cache either satisfies them in memory or
//! hands them back for the storage layer to execute. Write jobs stay
//! queued on their piece until the dirty block flushes, at which point the
//! completion channel fires.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::constants::BLOCK_SIZE;
use crate::error::JobError;
use crate::storage::StorageHandle;

/// What a job asks the disk layer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    /// Copy `len` bytes starting at `offset` out of the piece.
    Read,
    /// Write the payload buffer at `offset` within the piece.
    Write,
    /// Compute the piece hash.
    Hash,
}

/// Outcome delivered on a job's completion channel: bytes moved on
/// success, or why the job will never complete.
pub type JobResult = Result<usize, JobError>;

/// One disk I/O job.
#[derive(Debug)]
pub struct DiskJob {
    /// The operation requested.
    pub action: JobAction,
    /// Storage the target piece belongs to.
    pub storage: StorageHandle,
    /// Piece index within the storage.
    pub piece: u32,
    /// Byte offset within the piece.
    pub offset: u32,
    /// Number of bytes to read or write.
    pub len: u32,
    /// Write payload, or the data produced by a cache read. Ownership of
    /// a write payload transfers to the cache in `add_dirty_block`.
    pub buf: Option<Bytes>,
    /// Marks a one-shot read; pieces it populates go on the volatile LRU.
    pub volatile_read: bool,
    done: Option<oneshot::Sender<JobResult>>,
}

impl DiskJob {
    /// Creates a read job.
    pub fn read(storage: StorageHandle, piece: u32, offset: u32, len: u32) -> Self {
        Self {
            action: JobAction::Read,
            storage,
            piece,
            offset,
            len,
            buf: None,
            volatile_read: false,
            done: None,
        }
    }

    /// Creates a write job carrying its payload. The payload is at most
    /// one block long.
    pub fn write(storage: StorageHandle, piece: u32, offset: u32, buf: Bytes) -> Self {
        debug_assert!(buf.len() <= BLOCK_SIZE);
        let len = buf.len() as u32;
        Self {
            action: JobAction::Write,
            storage,
            piece,
            offset,
            len,
            buf: Some(buf),
            volatile_read: false,
            done: None,
        }
    }

    /// Creates a hash job for a whole piece.
    pub fn hash(storage: StorageHandle, piece: u32) -> Self {
        let len = storage.piece_len(piece);
        Self {
            action: JobAction::Hash,
            storage,
            piece,
            offset: 0,
            len,
            buf: None,
            volatile_read: false,
            done: None,
        }
    }

    /// Flags this read as one-shot (volatile).
    pub fn volatile(mut self) -> Self {
        self.volatile_read = true;
        self
    }

    /// Arms the completion channel and returns its receiving half.
    pub fn subscribe(&mut self) -> oneshot::Receiver<JobResult> {
        let (tx, rx) = oneshot::channel();
        self.done = Some(tx);
        rx
    }

    /// The block slot this job's offset falls in.
    pub fn block(&self) -> usize {
        self.offset as usize / BLOCK_SIZE
    }

    /// Completes the job. A missing or dropped receiver is fine; the
    /// result is simply discarded.
    pub fn finish(self, result: JobResult) {
        if let Some(tx) = self.done {
            let _ = tx.send(result);
        }
    }

    pub(crate) fn key(&self) -> (u64, u32) {
        (self.storage.id(), self.piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_block_index() {
        let st = StorageHandle::new(16 * BLOCK_SIZE as u32, 64 * BLOCK_SIZE as u64);
        let j = DiskJob::read(st.clone(), 0, 3 * BLOCK_SIZE as u32 + 100, 200);
        assert_eq!(j.block(), 3);

        let w = DiskJob::write(st, 1, 0, Bytes::from(vec![0u8; BLOCK_SIZE]));
        assert_eq!(w.block(), 0);
        assert_eq!(w.len as usize, BLOCK_SIZE);
    }

    #[test]
    fn test_job_completion_channel() {
        let st = StorageHandle::new(16 * BLOCK_SIZE as u32, 64 * BLOCK_SIZE as u64);
        let mut j = DiskJob::write(st, 0, 0, Bytes::from(vec![1u8; 16]));
        let mut rx = j.subscribe();

        assert!(rx.try_recv().is_err());
        j.finish(Ok(16));
        assert_eq!(rx.try_recv().unwrap(), Ok(16));
    }
}
