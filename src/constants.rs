//! Cache tuning parameters.
//!
//! Defaults are derived from libtorrent's session settings, with the same
//! meanings. All sizes are counted in blocks, not bytes.

use std::time::Duration;

// ============================================================================
// Block geometry
// ============================================================================

/// Standard block size (16 KiB); the unit of buffer allocation.
pub const BLOCK_SIZE: usize = 16384;

// ============================================================================
// Cache budget
// ============================================================================

/// Default global block budget (1024 blocks = 16 MiB).
pub const DEFAULT_CACHE_SIZE: usize = 1024;

/// Default TTL after which a clean write piece may be flushed aggressively.
pub const DEFAULT_CACHE_EXPIRY: Duration = Duration::from_secs(300);

/// Default read-ahead window, in blocks (libtorrent: read_cache_line_size).
pub const DEFAULT_READ_CACHE_LINE_SIZE: usize = 32;

/// Default cap on blocks held by volatile (one-shot) pieces.
pub const DEFAULT_VOLATILE_CACHE_SIZE: usize = 128;

/// Default size of each ARC ghost list, as a fraction of the cache's
/// piece capacity.
pub const DEFAULT_GHOST_LIST_FRACTION: f32 = 0.5;

/// Ghost lists never shrink below this many entries.
pub const MIN_GHOST_PIECES: usize = 8;

// ============================================================================
// Buffer pool
// ============================================================================

/// Default number of block buffers the pool will hand out before
/// reporting exhaustion.
pub const DEFAULT_POOL_BLOCKS: usize = 2048;
