use serde::Serialize;

/// Pool event counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Allocations satisfied from the cache.
    pub cache_hits: u64,

    /// Allocations that needed a free page.
    pub cache_misses: u64,

    /// Cache probes that found the guest address with another format.
    pub kind_mismatches: u64,

    /// Pages evicted from the age list tail.
    pub evictions: u64,

    /// Times the user record free list ran dry.
    pub free_one_user: u64,

    /// Alias fields that overflowed.
    pub phys_ext_alloc_failures: u64,

    /// Pages destroyed.
    pub flushes: u64,

    /// Successful pool growths.
    pub grows: u64,

    /// Leaf page resets.
    pub clear_alls: u64,

    /// Guest writes patched into the shadows.
    pub monitor_handled: u64,

    /// Monitored chains flushed.
    pub monitor_flushes: u64,

    /// Pages parked on the dirty fast path.
    pub dirty_added: u64,

    /// Dirty slots flushed.
    pub dirty_flushed: u64,
}
