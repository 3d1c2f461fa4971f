use thiserror::Error;

/// Why `try_read` did not produce data.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TryReadError {
    /// The requested blocks are not all resident and valid. The caller
    /// should issue a storage read.
    #[error("requested blocks are not in the cache")]
    Miss,

    /// The response buffer could not be allocated, even after evicting.
    #[error("response buffer allocation failed")]
    Allocation,
}

/// Terminal failure reported through a job's completion channel.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum JobError {
    /// A newer write landed on the same block before this one flushed.
    #[error("write superseded by a newer buffer for the same block")]
    Superseded,

    /// The cache was cleared or the piece dropped before the job completed.
    #[error("job cancelled before completion")]
    Cancelled,
}
