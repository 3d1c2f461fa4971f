//! Runtime-adjustable cache configuration.

use std::time::Duration;

use crate::constants::{
    DEFAULT_CACHE_EXPIRY, DEFAULT_CACHE_SIZE, DEFAULT_GHOST_LIST_FRACTION,
    DEFAULT_READ_CACHE_LINE_SIZE, DEFAULT_VOLATILE_CACHE_SIZE,
};

/// Settings consumed by [`BlockCache::set_settings`](crate::BlockCache::set_settings).
///
/// All sizes are in blocks.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Global block budget. When the number of live block buffers exceeds
    /// this, the cache evicts and asks the trim trigger for help.
    pub cache_size: usize,

    /// TTL after which a clean write piece becomes a preferred flush
    /// candidate (see `expired_write_pieces`).
    pub cache_expiry: Duration,

    /// Read-ahead window used by `pad_job`, in blocks.
    pub read_cache_line_size: usize,

    /// Cap on blocks held by volatile (one-shot) pieces. Once reached,
    /// volatile blocks are evicted before anything else.
    pub volatile_read_cache_size: usize,

    /// Size of each ghost list as a fraction of the cache's piece
    /// capacity (cache_size / read_cache_line_size).
    pub ghost_list_fraction: f32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            cache_expiry: DEFAULT_CACHE_EXPIRY,
            read_cache_line_size: DEFAULT_READ_CACHE_LINE_SIZE,
            volatile_read_cache_size: DEFAULT_VOLATILE_CACHE_SIZE,
            ghost_list_fraction: DEFAULT_GHOST_LIST_FRACTION,
        }
    }
}

impl CacheSettings {
    /// Number of entries each ghost list is allowed to hold.
    pub(crate) fn ghost_size(&self) -> usize {
        let pieces = self.cache_size / self.read_cache_line_size.max(4);
        ((pieces as f32 * self.ghost_list_fraction) as usize)
            .max(crate::constants::MIN_GHOST_PIECES)
    }
}
