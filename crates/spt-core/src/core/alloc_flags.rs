use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Per-allocation policy flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AllocFlags: u8 {
        /// The page may stay resident in the cache after it is freed.
        const CACHEABLE = 0b00000001;

        /// Pin the page against eviction until it is explicitly unlocked.
        const LOCK = 0b00000010;

        /// The guest has the A20 gate enabled.
        const A20 = 0b00000100;
    }
}
