//! Shadow page-table pool.
//!
//! The pool owns every shadow page table of a virtual machine. Each shadow
//! table lives in a [`PoolPage`] addressed by a [`PoolIdx`]; index 0 is the
//! NIL page and never holds a table.
//!
//! # Caching
//!
//! Pages are found by guest physical address through a fixed-size hash
//! index. A freed page allocated with [`AllocFlags::CACHEABLE`] keeps its
//! content and is handed out again on the next allocation for the same
//! guest address and [`PoolFormat`]. When the pool runs out of pages it
//! grows through the [`PoolGrow`](spt_core::PoolGrow) collaborator until
//! the configured maximum and then evicts the least recently used page.
//!
//! # Reference tracking
//!
//! Every shadow entry that points at another pool page is recorded as a user
//! of that page, so that destroying the page can clear the entries pointing
//! at it. Every leaf entry that maps guest memory is recorded in the alias
//! tracking field of the guest page (an inline reference plus a chain of
//! physical extents), so that remapping the guest page can find every shadow
//! entry mapping it.
//!
//! # Monitoring
//!
//! Pages shadowing guest paging structures write-protect the guest page
//! through the [`PoolAccessHandler`](spt_core::PoolAccessHandler)
//! collaborator. Pages shadowing the same guest page share one registration.
//! A write fault is patched into the shadow or absorbed by the dirty page
//! fast path. Otherwise the shadows are flushed. See [`PagePool::handle_write_fault`].
//!
//! # Concurrency
//!
//! [`PagePool`] itself is single threaded. [`SharedPagePool`] puts it behind
//! one coarse lock and runs [`PagePool::clear_all`] through a
//! [`Rendezvous`] so that no executor can touch a shadow table while it is
//! being reset.

mod cache;
mod clear;
mod dirty;
mod flush;
mod iter;
mod monitor;
mod page;
mod physext;
mod shared;
mod stats;
mod user;

#[cfg(test)]
mod mock;
#[cfg(test)]
mod tracking_tests;

use std::collections::HashMap;

pub use spt_arch_x86::{PoolAccess, PoolFormat};
pub use spt_core::{
    AllocFlags, Gfn, Gpa, HostFrame, PhysExtIdx, PoolBackend, PoolConfig, PoolError, PoolIdx,
    Rendezvous, Resource, UserIdx,
};

use self::{dirty::DirtyTable, physext::PhysExtent, user::UserRecord};
pub use self::{
    monitor::{GuestWrite, WriteFault, WriteFaultOutcome},
    page::PoolPage,
    physext::AliasOutcome,
    shared::SharedPagePool,
    stats::PoolStats,
    user::PoolUser,
};

/// Number of hash buckets.
const HASH_SIZE: usize = 0x8000;

/// Maximum number of pages requested from the backing allocator at once.
const MAX_GROW: u16 = 512;

/// Number of pages below which a failing backing allocation is fatal.
const MIN_VIABLE_PAGES: u16 = 64;

/// Result of a successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAlloc {
    /// A cached page with unchanged content.
    Cached(PoolIdx),

    /// A new, zeroed page the caller has to fill.
    New(PoolIdx),
}

impl PoolAlloc {
    /// Returns the index of the allocated page.
    pub fn index(self) -> PoolIdx {
        match self {
            Self::Cached(idx) | Self::New(idx) => idx,
        }
    }

    /// Checks if the allocation was satisfied from the cache.
    pub fn is_cached(self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

/// The shadow page-table pool.
pub struct PagePool<Driver>
where
    Driver: PoolBackend,
{
    driver: Driver,
    config: PoolConfig,

    /// Pool pages. Index 0 is the NIL page.
    pages: Vec<PoolPage>,

    /// Head of the free page list, linked through `hash_next`.
    free_head: PoolIdx,

    /// Number of pages holding a shadow table.
    used_pages: u16,

    /// Hash buckets, keyed by guest frame number.
    hash: Box<[PoolIdx]>,

    /// Age list. The head is the most recently used page.
    age_head: PoolIdx,
    age_tail: PoolIdx,

    /// Pages with tracked guest writes.
    modified_head: PoolIdx,
    modified_pages: u16,

    /// User records and the head of their free list.
    users: Vec<UserRecord>,
    user_free_head: UserIdx,

    /// Physical extent nodes and the head of their free list.
    phys_exts: Vec<PhysExtent>,
    phys_ext_free_head: PhysExtIdx,

    dirty: DirtyTable,

    /// Host frame backing each page, for resolving non-leaf entries.
    host_frames: HashMap<HostFrame, PoolIdx>,

    /// A full flush was requested and not yet performed.
    flush_pending: bool,

    /// Write fault sequence number, for reuse detection.
    access_seq: u64,

    stats: PoolStats,
}

impl<Driver> PagePool<Driver>
where
    Driver: PoolBackend,
{
    /// Creates an empty pool.
    ///
    /// No backing is allocated until the first allocation, or until
    /// [`grow`] is called.
    ///
    /// [`grow`]: Self::grow
    pub fn new(driver: Driver, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        tracing::debug!(
            max_pages = config.max_pages,
            max_users = config.max_users,
            max_phys_exts = config.max_phys_exts,
            cache_enabled = config.cache_enabled,
            "creating shadow page pool"
        );

        let mut pages = Vec::with_capacity(config.max_pages as usize + 1);
        pages.push(PoolPage::nil());

        let mut pool = Self {
            driver,
            config,
            pages,
            free_head: PoolIdx::NIL,
            used_pages: 0,
            hash: vec![PoolIdx::NIL; HASH_SIZE].into_boxed_slice(),
            age_head: PoolIdx::NIL,
            age_tail: PoolIdx::NIL,
            modified_head: PoolIdx::NIL,
            modified_pages: 0,
            users: Vec::new(),
            user_free_head: UserIdx::NIL,
            phys_exts: Vec::new(),
            phys_ext_free_head: PhysExtIdx::NIL,
            dirty: DirtyTable::new(),
            host_frames: HashMap::new(),
            flush_pending: false,
            access_seq: 0,
            stats: PoolStats::default(),
        };

        pool.users = user::new_user_arena(config.max_users);
        pool.user_free_head = UserIdx::new(0);
        pool.rebuild_phys_ext_free_list();

        Ok(pool)
    }

    /// Returns the driver.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the counters.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Returns the number of pages the pool currently has backing for.
    pub fn current_pages(&self) -> u16 {
        (self.pages.len() - 1) as u16
    }

    /// Returns the number of pages holding a shadow table.
    pub fn used_pages(&self) -> u16 {
        self.used_pages
    }

    /// Checks if a full flush was requested.
    pub fn is_flush_pending(&self) -> bool {
        self.flush_pending
    }

    /// Requests a full flush, performed by the next [`clear_all`].
    ///
    /// [`clear_all`]: Self::clear_all
    pub fn request_flush(&mut self) {
        self.flush_pending = true;
    }

    /// Adds backing pages, up to the configured maximum.
    ///
    /// This is a no-op once the maximum is reached. A failing backing
    /// allocator is tolerated as long as the pool already has a minimal
    /// number of pages; the pool then runs with fewer pages than configured.
    pub fn grow(&mut self) -> Result<(), PoolError> {
        let current = self.current_pages();
        if current >= self.config.max_pages {
            return Ok(());
        }

        let wanted = (self.config.max_pages - current).min(MAX_GROW);
        let frames = match self.driver.grow(wanted) {
            Ok(frames) if !frames.is_empty() => frames,
            Ok(_) => return self.grow_failed(current, None),
            Err(err) => return self.grow_failed(current, Some(err)),
        };

        let first = self.pages.len();
        for frame in frames.into_iter().take(wanted as usize) {
            let idx = PoolIdx::new(self.pages.len() as u16);
            if self.host_frames.insert(frame, idx).is_some() {
                tracing::error!(%frame, "host frame handed out twice");
                debug_assert!(false, "host frame handed out twice");
                continue;
            }

            self.pages.push(PoolPage::new(idx, frame));
        }

        //
        // Link the new pages so that the lowest index is handed out first.
        //
        for raw in (first..self.pages.len()).rev() {
            self.pages[raw].hash_next = self.free_head;
            self.free_head = PoolIdx::new(raw as u16);
        }

        self.stats.grows += 1;
        tracing::debug!(
            added = self.pages.len() - first,
            current = self.current_pages(),
            max = self.config.max_pages,
            "pool grown"
        );

        Ok(())
    }

    fn grow_failed(&mut self, current: u16, err: Option<PoolError>) -> Result<(), PoolError> {
        let minimum = MIN_VIABLE_PAGES.min(self.config.max_pages);
        if current >= minimum {
            tracing::warn!(current, ?err, "backing allocation failed, running with a smaller pool");
            return Ok(());
        }

        tracing::error!(current, minimum, ?err, "backing allocation failed");
        Err(PoolError::AllocationFailed { current, minimum })
    }

    /// Allocates a pool page shadowing `gpa` in the given `format`.
    ///
    /// `user` is the shadow entry that is going to point at the page, or
    /// `None` for root pages. The allocation is first looked up in the cache;
    /// a hit returns [`PoolAlloc::Cached`] with the content unchanged. On a
    /// miss a free page is taken, growing the pool or evicting the least
    /// recently used page when necessary, and [`PoolAlloc::New`] is
    /// returned.
    ///
    /// Fails with [`PoolError::ResourceExhausted`] when no page can be freed,
    /// in which case the caller should flush the whole pool and retry.
    pub fn alloc(
        &mut self,
        gpa: Gpa,
        format: PoolFormat,
        access: PoolAccess,
        user: Option<PoolUser>,
        flags: AllocFlags,
    ) -> Result<PoolAlloc, PoolError> {
        if matches!(format, PoolFormat::Free | PoolFormat::Invalid) {
            return Err(PoolError::InvariantViolation("allocating a free or invalid format"));
        }

        if let Some(user) = user {
            self.used_page(user.owner)?;
        }

        let a20 = flags.contains(AllocFlags::A20);

        if self.config.cache_enabled {
            if let Some(idx) = self.cache_alloc(gpa, format, access, a20, user)? {
                if flags.contains(AllocFlags::LOCK) {
                    self.lock_page(idx)?;
                }

                return Ok(PoolAlloc::Cached(idx));
            }
        }

        self.stats.cache_misses += 1;

        let protect = user.map_or(PoolIdx::NIL, |user| user.owner);
        if self.free_head.is_nil() {
            self.make_more_free_pages(protect)?;
        }

        let idx = self.free_head;
        let page = &mut self.pages[idx.as_usize()];
        debug_assert_eq!(page.format, PoolFormat::Free);
        self.free_head = page.hash_next;

        page.prepare(format, access, gpa, a20);

        self.used_pages += 1;

        if let Some(user) = user {
            if let Err(err) = self.add_user_record(idx, user) {
                self.release_to_free_list(idx);
                return Err(err);
            }
        }

        let cacheable = flags.contains(AllocFlags::CACHEABLE) && self.config.cache_enabled;
        self.cache_insert(idx, cacheable);

        if format.is_monitored() {
            if let Err(err) = self.monitor_insert(idx) {
                tracing::error!(%gpa, %idx, %err, "failed to monitor page");
                self.flush_page(idx, true)?;
                return Err(err);
            }
        }

        if flags.contains(AllocFlags::LOCK) {
            self.lock_page(idx)?;
        }

        tracing::debug!(%gpa, %idx, %format, cacheable, "page allocated");
        Ok(PoolAlloc::New(idx))
    }

    /// Releases a page.
    ///
    /// `user` is the shadow entry that pointed at the page, if any. A cached
    /// page keeps its content and stays in the cache. Any other page is
    /// destroyed.
    pub fn free(&mut self, idx: PoolIdx, user: Option<PoolUser>) -> Result<(), PoolError> {
        self.used_page(idx)?;

        if let Some(user) = user {
            if !self.free_user_record(idx, user) {
                tracing::error!(%idx, ?user, "freeing page through an unknown user");
                debug_assert!(false, "freeing page through an unknown user");
            }
        }

        if self.pages[idx.as_usize()].is_cached() {
            tracing::trace!(%idx, "page parked in cache");
            return Ok(());
        }

        self.flush_page(idx, true)
    }

    /// Pins a page against eviction and flushing.
    pub fn lock_page(&mut self, idx: PoolIdx) -> Result<(), PoolError> {
        self.used_page(idx)?;

        let page = &mut self.pages[idx.as_usize()];
        page.lock_count = page.lock_count.checked_add(1).ok_or(
            PoolError::InvariantViolation("lock count overflow"),
        )?;

        Ok(())
    }

    /// Removes one pin added by [`lock_page`] or [`AllocFlags::LOCK`].
    ///
    /// [`lock_page`]: Self::lock_page
    pub fn unlock_page(&mut self, idx: PoolIdx) -> Result<(), PoolError> {
        self.used_page(idx)?;

        let page = &mut self.pages[idx.as_usize()];
        if page.lock_count == 0 {
            return Err(PoolError::InvariantViolation("unlocking an unlocked page"));
        }

        page.lock_count -= 1;
        Ok(())
    }

    /// Makes sure the free list is not empty.
    fn make_more_free_pages(&mut self, protect: PoolIdx) -> Result<(), PoolError> {
        if self.current_pages() < self.config.max_pages {
            self.grow()?;
            if !self.free_head.is_nil() {
                return Ok(());
            }
        }

        if !self.config.cache_enabled {
            return Err(PoolError::ResourceExhausted(Resource::Pages));
        }

        self.cache_free_one(protect)
    }

    /// Returns a page that was taken off the free list back to it.
    fn release_to_free_list(&mut self, idx: PoolIdx) {
        let free_head = self.free_head;
        let page = &mut self.pages[idx.as_usize()];
        page.reinit_free();
        page.hash_next = free_head;
        self.free_head = idx;
        self.used_pages -= 1;
    }

    /// Returns a page that holds a shadow table.
    fn used_page(&self, idx: PoolIdx) -> Result<&PoolPage, PoolError> {
        self.pages
            .get(idx.as_usize())
            .filter(|page| page.is_used())
            .ok_or(PoolError::InvalidIndex(idx))
    }
}
