//! Hash index and age list.

use spt_arch_x86::{PoolAccess, PoolFormat};
use spt_core::{Gfn, Gpa, PoolBackend, PoolError, PoolIdx, Resource};

use crate::{HASH_SIZE, PagePool, PoolUser, page::PageFlags};

/// Maximum number of age list entries inspected when looking for a victim.
const CACHE_FREE_ONE_LIMIT: usize = 8192;

/// Returns the hash bucket of a guest frame.
pub(crate) fn hash_bucket(gfn: Gfn) -> usize {
    (gfn.0 as usize) & (HASH_SIZE - 1)
}

impl<Driver> PagePool<Driver>
where
    Driver: PoolBackend,
{
    /// Looks up a cached page for an allocation.
    ///
    /// Returns `None` on a miss. A cached page of a different format found
    /// for the same guest address is flushed when the guest table was
    /// evidently recycled for the requested format.
    pub(crate) fn cache_alloc(
        &mut self,
        gpa: Gpa,
        format: PoolFormat,
        access: PoolAccess,
        a20: bool,
        user: Option<PoolUser>,
    ) -> Result<Option<PoolIdx>, PoolError> {
        let mut idx = self.hash[hash_bucket(gpa.gfn())];

        while !idx.is_nil() {
            let page = &self.pages[idx.as_usize()];
            let next = page.hash_next;

            if page.gpa != gpa || !page.is_cached() {
                idx = next;
                continue;
            }

            if page.format != format {
                self.stats.kind_mismatches += 1;

                if page.format.reused_by(format) {
                    tracing::debug!(
                        %gpa,
                        %idx,
                        cached = %page.format,
                        requested = %format,
                        "flushing recycled guest table"
                    );

                    self.flush_page(idx, true)?;
                    return Ok(None);
                }

                idx = next;
                continue;
            }

            if page.access != access || page.a20_enabled() != a20 {
                idx = next;
                continue;
            }

            if !page.present_consistent() {
                tracing::error!(%gpa, %idx, "cached page has inconsistent present bookkeeping");
                debug_assert!(false, "cached page has inconsistent present bookkeeping");
                self.flush_page(idx, true)?;
                return Ok(None);
            }

            //
            // Hit. Pin the page while adding the user, freeing up a user
            // record may evict pages.
            //
            if let Some(user) = user {
                self.pages[idx.as_usize()].lock_count += 1;
                let result = self.add_user_record(idx, user);
                self.pages[idx.as_usize()].lock_count -= 1;
                result?;
            }

            self.cache_used(idx);

            let page = &mut self.pages[idx.as_usize()];
            if page.modifications != 0 {
                // Zero would put it back on the modified list.
                page.modifications = 1;
            }

            self.stats.cache_hits += 1;
            tracing::trace!(%gpa, %idx, %format, "cache hit");
            return Ok(Some(idx));
        }

        Ok(None)
    }

    /// Inserts a new page into the hash index and at the head of the age
    /// list.
    pub(crate) fn cache_insert(&mut self, idx: PoolIdx, cacheable: bool) {
        if cacheable {
            self.pages[idx.as_usize()].flags |= PageFlags::CACHED;
        }

        self.hash_insert(idx);
        self.cache_used(idx);
    }

    /// Removes a page from the hash index and the age list.
    pub(crate) fn cache_flush_page(&mut self, idx: PoolIdx) {
        self.hash_remove(idx);
        self.age_unlink(idx);
        self.pages[idx.as_usize()].flags.remove(PageFlags::CACHED);
    }

    /// Marks a page as used by moving it to the head of the age list.
    pub(crate) fn cache_used(&mut self, idx: PoolIdx) {
        if self.age_head == idx {
            return;
        }

        self.age_unlink(idx);
        self.age_insert_head(idx);
    }

    /// Stops a page from being found by cache probes.
    pub(crate) fn cache_forget(&mut self, idx: PoolIdx) {
        let page = &mut self.pages[idx.as_usize()];
        if page.is_cached() {
            tracing::debug!(%idx, gpa = %page.gpa, "page no longer cacheable");
            page.flags.remove(PageFlags::CACHED);
        }
    }

    /// Evicts the least recently used page that is neither locked nor
    /// `protect`.
    pub(crate) fn cache_free_one(&mut self, protect: PoolIdx) -> Result<(), PoolError> {
        for _ in 0..CACHE_FREE_ONE_LIMIT {
            let idx = self.age_tail;
            if idx.is_nil() {
                break;
            }

            let page = &self.pages[idx.as_usize()];
            if page.lock_count > 0 || idx == protect {
                //
                // Rotate it to the head so the next candidate surfaces at
                // the tail.
                //
                self.cache_used(idx);
                continue;
            }

            tracing::debug!(%idx, gpa = %page.gpa, format = %page.format, "evicting page");
            self.stats.evictions += 1;
            return self.flush_page(idx, true);
        }

        tracing::warn!("no evictable page");
        Err(PoolError::ResourceExhausted(Resource::Pages))
    }

    pub(crate) fn hash_insert(&mut self, idx: PoolIdx) {
        let bucket = hash_bucket(self.pages[idx.as_usize()].gpa.gfn());
        self.pages[idx.as_usize()].hash_next = self.hash[bucket];
        self.hash[bucket] = idx;
    }

    pub(crate) fn hash_remove(&mut self, idx: PoolIdx) {
        let bucket = hash_bucket(self.pages[idx.as_usize()].gpa.gfn());
        let next = self.pages[idx.as_usize()].hash_next;

        if self.hash[bucket] == idx {
            self.hash[bucket] = next;
        }
        else {
            let mut prev = self.hash[bucket];
            while !prev.is_nil() {
                let prev_next = self.pages[prev.as_usize()].hash_next;
                if prev_next == idx {
                    self.pages[prev.as_usize()].hash_next = next;
                    break;
                }

                prev = prev_next;
            }

            debug_assert!(!prev.is_nil(), "page not in its hash chain");
        }

        self.pages[idx.as_usize()].hash_next = PoolIdx::NIL;
    }

    /// Returns the pages in the hash chain of a guest frame.
    pub(crate) fn hash_chain(&self, gfn: Gfn) -> impl Iterator<Item = PoolIdx> + '_ {
        let mut idx = self.hash[hash_bucket(gfn)];
        std::iter::from_fn(move || {
            if idx.is_nil() {
                return None;
            }

            let current = idx;
            idx = self.pages[idx.as_usize()].hash_next;
            Some(current)
        })
    }

    fn age_insert_head(&mut self, idx: PoolIdx) {
        let head = self.age_head;

        let page = &mut self.pages[idx.as_usize()];
        page.age_prev = PoolIdx::NIL;
        page.age_next = head;

        if head.is_nil() {
            self.age_tail = idx;
        }
        else {
            self.pages[head.as_usize()].age_prev = idx;
        }

        self.age_head = idx;
    }

    fn age_unlink(&mut self, idx: PoolIdx) {
        let page = &self.pages[idx.as_usize()];
        let (prev, next) = (page.age_prev, page.age_next);

        if prev.is_nil() {
            if self.age_head != idx {
                // Not on the age list.
                return;
            }

            self.age_head = next;
        }
        else {
            self.pages[prev.as_usize()].age_next = next;
        }

        if next.is_nil() {
            self.age_tail = prev;
        }
        else {
            self.pages[next.as_usize()].age_prev = prev;
        }

        let page = &mut self.pages[idx.as_usize()];
        page.age_prev = PoolIdx::NIL;
        page.age_next = PoolIdx::NIL;
    }

    /// Returns the pages on the age list, most recently used first.
    pub fn age_list(&self) -> impl Iterator<Item = PoolIdx> + '_ {
        let mut idx = self.age_head;
        std::iter::from_fn(move || {
            if idx.is_nil() {
                return None;
            }

            let current = idx;
            idx = self.pages[idx.as_usize()].age_next;
            Some(current)
        })
    }
}
