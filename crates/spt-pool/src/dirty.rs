//! Dirty page fast path.
//!
//! A leaf page that takes too many guest writes is temporarily left
//! writable instead of being flushed. The guest table is snapshot when the
//! page is parked, and on flush the snapshot is compared with the current
//! guest table so that only the changed shadow entries are dropped.

use smallvec::SmallVec;
use spt_core::{Gfn, PoolBackend, PoolError, PoolIdx};

use crate::{PagePool, page::PageFlags};

/// Number of dirty page slots.
pub(crate) const DIRTY_SLOTS: usize = 16;

#[derive(Debug)]
struct DirtyEntry {
    page: PoolIdx,

    /// The guest window as it was when the page was parked.
    snapshot: Box<[u8]>,
}

/// Fixed-size table of parked pages, filled in FIFO order.
#[derive(Debug)]
pub(crate) struct DirtyTable {
    slots: [Option<DirtyEntry>; DIRTY_SLOTS],
    next_free: usize,
    count: usize,
}

impl DirtyTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            next_free: 0,
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn occupied(&self) -> impl Iterator<Item = (usize, PoolIdx)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|entry| (slot, entry.page)))
    }
}

impl<Driver> PagePool<Driver>
where
    Driver: PoolBackend,
{
    /// Parks a monitored leaf page on the dirty fast path.
    ///
    /// Returns `false` if the page could not be parked because a locked
    /// sibling keeps it on a shared registration.
    pub(crate) fn add_dirty_page(&mut self, idx: PoolIdx) -> Result<bool, PoolError> {
        let page = &self.pages[idx.as_usize()];
        debug_assert!(page.format.is_dirty_eligible());
        debug_assert!(!page.is_dirty());

        let gpa = page.gpa;
        let gfn = gpa.gfn();

        //
        // The page has to own the registration alone.
        //
        let siblings: SmallVec<[PoolIdx; 4]> = self
            .monitor_chain(gfn)
            .filter(|&sibling| sibling != idx)
            .collect();

        for sibling in siblings {
            self.flush_page(sibling, true)?;
        }

        let page = &self.pages[idx.as_usize()];
        if !page.monitored_prev.is_nil() || !page.monitored_next.is_nil() {
            tracing::debug!(%idx, %gpa, "locked sibling keeps the page monitored");
            return Ok(false);
        }

        let slot = self.dirty.next_free;
        if self.dirty.slots[slot].is_some() {
            debug_assert_eq!(self.dirty.count, DIRTY_SLOTS);
            tracing::debug!(slot, "dirty table full, flushing oldest slot");
            self.flush_dirty_slot(slot)?;
        }

        let snapshot = self.read_guest_window(idx)?;
        self.driver.temp_off_write_handler(gfn)?;

        let page = &mut self.pages[idx.as_usize()];
        page.flags |= PageFlags::DIRTY;
        page.dirty_slot = slot as u8;

        self.dirty.slots[slot] = Some(DirtyEntry {
            page: idx,
            snapshot,
        });
        self.dirty.count += 1;

        self.dirty.next_free = (slot + 1) % DIRTY_SLOTS;
        if self.dirty.count < DIRTY_SLOTS && self.dirty.slots[self.dirty.next_free].is_some() {
            if let Some(free) = (1..DIRTY_SLOTS)
                .map(|i| (self.dirty.next_free + i) % DIRTY_SLOTS)
                .find(|&i| self.dirty.slots[i].is_none())
            {
                self.dirty.next_free = free;
            }
        }

        self.clear_page_users(idx);
        self.stats.dirty_added += 1;

        tracing::debug!(%idx, %gpa, slot, "page parked on the dirty fast path");
        Ok(true)
    }

    /// Re-arms write protection for a parked page and drops the shadow
    /// entries whose guest entries changed.
    pub(crate) fn flush_dirty_slot(&mut self, slot: usize) -> Result<(), PoolError> {
        let Some(entry) = self.dirty.slots[slot].take() else {
            return Ok(());
        };

        let idx = entry.page;
        let gpa = self.pages[idx.as_usize()].gpa;

        let result = self.driver.reset_write_handler(gpa.gfn());
        self.pages[idx.as_usize()].flags.remove(PageFlags::DIRTY);

        let changes = match self.read_guest_window(idx) {
            Ok(current) => self.drop_changed_entries(idx, &entry.snapshot, &current),
            Err(err) => {
                //
                // Without the current guest table nothing can be trusted.
                //
                tracing::warn!(
                    %idx,
                    %gpa,
                    %err,
                    "failed to read guest table, dropping all entries"
                );
                self.drop_all_entries(idx)
            }
        };

        let page = &mut self.pages[idx.as_usize()];
        page.modifications = if changes < 4 {
            1
        }
        else {
            (page.modifications / 2).max(1)
        };

        if self.dirty.count == DIRTY_SLOTS {
            self.dirty.next_free = slot;
        }

        self.dirty.count -= 1;
        self.stats.dirty_flushed += 1;

        tracing::debug!(%idx, %gpa, slot, changes, "dirty page flushed");
        result
    }

    /// Flushes every dirty slot.
    pub(crate) fn reset_dirty_pages(&mut self) -> Result<(), PoolError> {
        let mut result = Ok(());

        for slot in 0..DIRTY_SLOTS {
            if let Err(err) = self.flush_dirty_slot(slot) {
                tracing::error!(slot, %err, "failed to flush dirty slot");
                result = Err(err);
            }
        }

        self.dirty.next_free = 0;
        result
    }

    /// Checks if the guest page is parked on the dirty fast path.
    pub fn is_dirty_gfn(&self, gfn: Gfn) -> bool {
        self.dirty
            .occupied()
            .any(|(_, idx)| self.pages[idx.as_usize()].gpa.gfn() == gfn)
    }

    /// Returns the number of parked pages.
    pub fn dirty_pages(&self) -> usize {
        self.dirty.count()
    }

    fn read_guest_window(&self, idx: PoolIdx) -> Result<Box<[u8]>, PoolError> {
        let page = &self.pages[idx.as_usize()];
        let guest = self.driver.read_guest_page(page.gpa.gfn())?;

        let start = page.gpa.page_offset() as usize;
        let end = start + page.format.guest_window_len() as usize;

        guest
            .get(start..end)
            .map(Box::from)
            .ok_or(PoolError::InvariantViolation("short guest page read"))
    }

    fn drop_changed_entries(&mut self, idx: PoolIdx, snapshot: &[u8], current: &[u8]) -> usize {
        let page = &self.pages[idx.as_usize()];
        let format = page.format;
        let window_start = page.gpa.page_offset();
        let Some(guest_entry_size) = format.guest_entry_size() else {
            return 0;
        };

        let mut changes = 0;
        for (i, (old, new)) in snapshot
            .chunks_exact(guest_entry_size)
            .zip(current.chunks_exact(guest_entry_size))
            .enumerate()
        {
            if old == new {
                continue;
            }

            changes += 1;

            let offset = window_start + (i * guest_entry_size) as u64;
            for slot in format.affected_entries(window_start, offset, guest_entry_size as u64) {
                self.deref_entry(idx, slot);
            }
        }

        changes
    }

    fn drop_all_entries(&mut self, idx: PoolIdx) -> usize {
        let count = self.pages[idx.as_usize()].format.entry_count();
        let mut changes = 0;

        for slot in 0..count {
            if self.pages[idx.as_usize()].entry_present(slot) {
                self.deref_entry(idx, slot);
                changes += 1;
            }
        }

        changes
    }
}
