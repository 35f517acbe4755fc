use serde::{Deserialize, Serialize};

use crate::{PAGE_SHIFT, PAGE_SIZE, PoolError, PoolIdx};

/// Shadow page pool configuration.
///
/// Use [`PoolConfig::from_ram_size`] to derive the defaults and the `with_*`
/// builders to override individual values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of pool pages, not counting the NIL page.
    pub max_pages: u16,

    /// Maximum number of user records.
    pub max_users: u16,

    /// Maximum number of physical extent nodes.
    pub max_phys_exts: u16,

    /// Whether freed pages are kept in the cache.
    pub cache_enabled: bool,

    /// Whether heavily written leaf tables may be left writable for a while
    /// instead of being flushed.
    pub dirty_tracking: bool,
}

impl PoolConfig {
    /// The smallest `max_pages` value accepted.
    pub const MIN_PAGES: u16 = 16;

    /// The largest `max_pages` value accepted.
    pub const MAX_PAGES: u16 = PoolIdx::LAST.0 & !0xf;

    /// The largest `max_users` value accepted.
    pub const MAX_USERS: u16 = 0x7fff;

    /// The largest `max_phys_exts` default.
    pub const DEFAULT_MAX_PHYS_EXTS: u16 = 8192;

    /// Derives the configuration from the guest RAM size in bytes.
    pub fn from_ram_size(ram_size: u64) -> Self {
        let bytes = (ram_size >> 9) + (ram_size >> 18) + (ram_size >> 27) + 32 * PAGE_SIZE;
        let pages = (bytes >> PAGE_SHIFT).min(Self::MAX_PAGES as u64) as u16;
        let max_pages = pages
            .max(Self::MIN_PAGES)
            .next_multiple_of(16)
            .min(Self::MAX_PAGES);

        Self::with_max_pages(max_pages)
    }

    /// Creates a configuration for exactly `max_pages` pool pages with the
    /// derived defaults for everything else.
    pub fn with_max_pages(max_pages: u16) -> Self {
        let max_users = max_pages.saturating_mul(2).min(Self::MAX_USERS);
        let max_phys_exts = max_pages
            .saturating_mul(2)
            .min(Self::DEFAULT_MAX_PHYS_EXTS);

        Self {
            max_pages,
            max_users,
            max_phys_exts,
            cache_enabled: true,
            dirty_tracking: true,
        }
    }

    /// Overrides the number of user records.
    pub fn with_max_users(self, max_users: u16) -> Self {
        Self { max_users, ..self }
    }

    /// Overrides the number of physical extent nodes.
    pub fn with_max_phys_exts(self, max_phys_exts: u16) -> Self {
        Self {
            max_phys_exts,
            ..self
        }
    }

    /// Enables or disables the page cache.
    pub fn with_cache(self, cache_enabled: bool) -> Self {
        Self {
            cache_enabled,
            ..self
        }
    }

    /// Enables or disables the dirty page fast path.
    pub fn with_dirty_tracking(self, dirty_tracking: bool) -> Self {
        Self {
            dirty_tracking,
            ..self
        }
    }

    /// Checks the configuration against the implementation limits.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_pages < Self::MIN_PAGES || self.max_pages > Self::MAX_PAGES {
            return Err(PoolError::InvalidConfig("max_pages out of range"));
        }

        if self.max_users < self.max_pages || self.max_users > Self::MAX_USERS {
            return Err(PoolError::InvalidConfig("max_users out of range"));
        }

        if self.max_phys_exts == 0 || self.max_phys_exts == u16::MAX {
            return Err(PoolError::InvalidConfig("max_phys_exts out of range"));
        }

        Ok(())
    }
}
