//! Page destruction and shadow entry bookkeeping.

use spt_core::{Gfn, PoolBackend, PoolError, PoolIdx};

use crate::{AliasOutcome, PagePool, PoolUser};

impl<Driver> PagePool<Driver>
where
    Driver: PoolBackend,
{
    /// Destroys a page and returns it to the free list.
    ///
    /// Locked pages are left alone. Every shadow entry pointing at the page
    /// is cleared, the page's own entries are dereferenced, and the page
    /// leaves the cache and the access monitor. When `flush_tlb` is set and
    /// the page was referenced, all TLBs are invalidated.
    pub(crate) fn flush_page(&mut self, idx: PoolIdx, flush_tlb: bool) -> Result<(), PoolError> {
        let page = self.used_page(idx)?;

        if page.lock_count > 0 {
            tracing::debug!(%idx, lock_count = page.lock_count, "not flushing locked page");
            return Ok(());
        }

        tracing::debug!(%idx, gpa = %page.gpa, format = %page.format, "flushing page");

        if page.is_dirty() {
            let slot = page.dirty_slot as usize;
            self.flush_dirty_slot(slot)?;
        }

        let had_users = self.pages[idx.as_usize()].has_users();
        self.clear_page_users(idx);
        self.track_deref(idx);
        self.cache_flush_page(idx);

        let monitor_result = if self.pages[idx.as_usize()].is_monitored() {
            self.monitor_flush(idx)
        }
        else {
            Ok(())
        };

        let free_head = self.free_head;
        let page = &mut self.pages[idx.as_usize()];
        page.reinit_free();
        page.hash_next = free_head;
        self.free_head = idx;
        self.used_pages -= 1;
        self.stats.flushes += 1;

        if had_users && flush_tlb {
            self.driver.invalidate_all_tlbs();
        }

        monitor_result
    }

    /// Dereferences every present entry of a page.
    fn track_deref(&mut self, idx: PoolIdx) {
        let page = &self.pages[idx.as_usize()];
        if page.present_count == 0 {
            return;
        }

        let first = page.first_present as usize;
        let count = page.format.entry_count();

        for slot in first..count {
            if self.pages[idx.as_usize()].present_count == 0 {
                break;
            }

            if self.pages[idx.as_usize()].entry_present(slot) {
                self.deref_entry(idx, slot);
            }
        }
    }

    /// Releases whatever a present entry references and clears it.
    ///
    /// Leaf entries drop their alias reference; non-leaf entries drop the
    /// user record of the child page.
    pub(crate) fn deref_entry(&mut self, idx: PoolIdx, slot: usize) {
        let page = &self.pages[idx.as_usize()];
        let raw = page.entry(slot);
        if !page.format.entry_present(raw) {
            return;
        }

        let target = page.format.entry_target(raw);

        if page.format.is_leaf() {
            match self.driver.guest_frame(target) {
                Some(gfn) => self.deref_gfn(gfn, idx, slot as u16),
                None => tracing::trace!(%idx, slot, %target, "leaf entry maps no guest RAM"),
            }
        }
        else {
            match self.host_frames.get(&target).copied() {
                Some(child) if self.pages[child.as_usize()].is_used() => {
                    let user = PoolUser::new(idx, slot as u16);
                    if !self.free_user_record(child, user) {
                        tracing::error!(%idx, slot, %child, "child page does not know its user");
                        debug_assert!(false, "child page does not know its user");
                    }
                }
                _ => {
                    tracing::error!(%idx, slot, %target, "entry points at no pool page");
                    debug_assert!(false, "entry points at no pool page");
                }
            }
        }

        self.clear_entry_raw(idx, slot);
    }

    fn deref_gfn(&mut self, gfn: Gfn, idx: PoolIdx, slot: u16) {
        match self.remove_ref(gfn, idx, slot) {
            Ok(()) => (),
            Err(PoolError::InvariantViolation(what)) => {
                tracing::error!(%gfn, %idx, slot, what, "alias tracking out of sync");
                debug_assert!(false, "alias tracking out of sync");
            }
            Err(err) => tracing::warn!(%gfn, %idx, slot, %err, "failed to drop alias reference"),
        }
    }

    /// Clears a shadow entry and updates the present bookkeeping.
    pub(crate) fn clear_entry_raw(&mut self, idx: PoolIdx, slot: usize) {
        let page = &mut self.pages[idx.as_usize()];
        let was_present = page.entry_present(slot);

        page.store_entry(slot, 0);
        if was_present {
            page.note_absent(slot as u16);
        }
    }

    fn check_slot(&self, idx: PoolIdx, slot: u16) -> Result<(), PoolError> {
        let page = self.used_page(idx)?;
        if slot as usize >= page.format.entry_count() {
            return Err(PoolError::InvariantViolation("entry index out of range"));
        }

        Ok(())
    }

    /// Maps guest page `gfn` through leaf entry `slot` of page `idx`.
    ///
    /// Any previous mapping of the entry is dropped first. When the guest
    /// page has too many mappings to track, the page is no longer found by
    /// cache probes and [`AliasOutcome::Overflowed`] is returned.
    pub fn map_leaf(
        &mut self,
        idx: PoolIdx,
        slot: u16,
        gfn: Gfn,
        writable: bool,
    ) -> Result<AliasOutcome, PoolError> {
        self.check_slot(idx, slot)?;

        let format = self.pages[idx.as_usize()].format;
        if !format.is_leaf() {
            return Err(PoolError::InvariantViolation("mapping guest memory from a non-leaf page"));
        }

        let host = self.driver.host_frame(gfn)?;
        if !format.can_address(host) {
            tracing::error!(%idx, slot, %gfn, %host, %format, "guest frame out of reach");
            return Err(PoolError::FrameOutOfReach(host));
        }

        self.deref_entry(idx, slot as usize);

        let outcome = self.add_ref(gfn, idx, slot)?;
        if outcome == AliasOutcome::Overflowed {
            self.cache_forget(idx);
        }

        let page = &mut self.pages[idx.as_usize()];
        page.store_entry(slot as usize, format.make_entry(host, writable));
        page.note_present(slot);

        tracing::trace!(%idx, slot, %gfn, %host, "leaf entry mapped");
        Ok(outcome)
    }

    /// Clears leaf entry `slot` of page `idx`.
    pub fn unmap_leaf(&mut self, idx: PoolIdx, slot: u16) -> Result<(), PoolError> {
        self.check_slot(idx, slot)?;

        if !self.pages[idx.as_usize()].format.is_leaf() {
            return Err(PoolError::InvariantViolation("unmapping a non-leaf entry"));
        }

        self.deref_entry(idx, slot as usize);
        Ok(())
    }

    /// Points entry `slot` of page `parent` at page `child`.
    ///
    /// Any previous target of the entry is dereferenced first. The user
    /// record is added unless the child was allocated for this entry.
    ///
    /// Fails with [`PoolError::FrameOutOfReach`] when the child's host
    /// frame does not fit the parent's entry format, leaving the entry as
    /// it was.
    pub fn link_child(
        &mut self,
        parent: PoolIdx,
        slot: u16,
        child: PoolIdx,
        writable: bool,
    ) -> Result<(), PoolError> {
        self.check_slot(parent, slot)?;
        self.used_page(child)?;

        let format = self.pages[parent.as_usize()].format;
        if format.is_leaf() {
            return Err(PoolError::InvariantViolation("linking a child page from a leaf page"));
        }

        let host = self.pages[child.as_usize()].host_frame;
        if !format.can_address(host) {
            tracing::error!(%parent, slot, %child, %host, %format, "child page out of reach");
            return Err(PoolError::FrameOutOfReach(host));
        }

        let user = PoolUser::new(parent, slot);
        self.deref_entry(parent, slot as usize);

        //
        // An allocation on behalf of this entry already recorded the user.
        //
        if !self.users(child).any(|existing| existing == user) {
            self.pages[parent.as_usize()].lock_count += 1;
            let result = self.add_user(child, user);
            self.pages[parent.as_usize()].lock_count -= 1;
            result?;
        }

        let page = &mut self.pages[parent.as_usize()];
        page.store_entry(slot as usize, format.make_entry(host, writable));
        page.note_present(slot);

        tracing::trace!(%parent, slot, %child, "child page linked");
        Ok(())
    }

    /// Clears non-leaf entry `slot` of page `parent`.
    pub fn unlink_child(&mut self, parent: PoolIdx, slot: u16) -> Result<(), PoolError> {
        self.check_slot(parent, slot)?;

        if self.pages[parent.as_usize()].format.is_leaf() {
            return Err(PoolError::InvariantViolation("unlinking a leaf entry"));
        }

        self.deref_entry(parent, slot as usize);
        Ok(())
    }
}
