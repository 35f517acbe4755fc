//! Access monitor.
//!
//! Every pool page shadowing a guest paging structure write-protects the
//! guest page. Pages shadowing the same guest page form a monitored sibling
//! chain; the chain head owns the single write handler registration.

use smallvec::SmallVec;
use spt_core::{Gfn, Gpa, PoolBackend, PoolError, PoolIdx};

use crate::{PagePool, page::{LastWrite, PageFlags}};

/// Maximum distance between the instruction pointers of two writes for the
/// second one to count as a continuation of the first.
const REUSE_IP_DISTANCE: u64 = 0x40;

/// Modification count past which reuse tracking restarts.
const REUSE_MODIFICATIONS_CAP: u16 = 8;

/// A decoded guest write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestWrite {
    /// A single store of `size` bytes.
    Store {
        /// Access size in bytes.
        size: u8,
    },

    /// A repeated string store.
    Bulk,

    /// A write the instruction decoder could not describe.
    Unsupported,
}

/// A write fault on a monitored guest page.
#[derive(Debug, Clone, Copy)]
pub struct WriteFault {
    /// The faulting guest physical address.
    pub gpa: Gpa,

    /// The decoded write.
    pub access: GuestWrite,

    /// The guest instruction pointer.
    pub ip: u64,
}

/// How a write fault was dealt with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFaultOutcome {
    /// No pool page monitors the guest page.
    NotMonitored,

    /// The affected shadow entries were invalidated and the write may be
    /// emulated.
    Handled,

    /// The page was parked on the dirty fast path; the guest may write the
    /// page directly.
    DirtyTracked,

    /// Every pool page shadowing the guest page was flushed.
    Flushed,
}

impl<Driver> PagePool<Driver>
where
    Driver: PoolBackend,
{
    /// Returns the head of the monitored chain of `gfn`.
    pub(crate) fn monitor_head(&self, gfn: Gfn) -> Option<PoolIdx> {
        self.hash_chain(gfn).find(|&idx| {
            let page = &self.pages[idx.as_usize()];
            page.gpa.gfn() == gfn && page.is_monitored() && page.monitored_prev.is_nil()
        })
    }

    /// Returns the pages in the monitored chain of `gfn`, head first.
    pub(crate) fn monitor_chain(&self, gfn: Gfn) -> impl Iterator<Item = PoolIdx> + '_ {
        let mut idx = self.monitor_head(gfn).unwrap_or(PoolIdx::NIL);
        std::iter::from_fn(move || {
            if idx.is_nil() {
                return None;
            }

            let current = idx;
            idx = self.pages[idx.as_usize()].monitored_next;
            Some(current)
        })
    }

    /// Starts monitoring the guest page shadowed by a new page.
    pub(crate) fn monitor_insert(&mut self, idx: PoolIdx) -> Result<(), PoolError> {
        let gfn = self.pages[idx.as_usize()].gpa.gfn();

        match self.monitor_head(gfn).filter(|&head| head != idx) {
            Some(head) => {
                if self.pages[head.as_usize()].is_dirty() {
                    let slot = self.pages[head.as_usize()].dirty_slot as usize;
                    self.flush_dirty_slot(slot)?;
                }

                let next = self.pages[head.as_usize()].monitored_next;
                if !next.is_nil() {
                    self.pages[next.as_usize()].monitored_prev = idx;
                }

                let page = &mut self.pages[idx.as_usize()];
                page.monitored_prev = head;
                page.monitored_next = next;
                self.pages[head.as_usize()].monitored_next = idx;

                tracing::trace!(%idx, %head, %gfn, "linked into monitored chain");
            }
            None => {
                self.driver.register_write_handler(gfn, idx)?;
                tracing::trace!(%idx, %gfn, "write handler registered");
            }
        }

        self.pages[idx.as_usize()].flags |= PageFlags::MONITORED;
        Ok(())
    }

    /// Stops monitoring for a page.
    ///
    /// The chain bookkeeping is always updated; a collaborator error is
    /// returned afterwards.
    pub(crate) fn monitor_flush(&mut self, idx: PoolIdx) -> Result<(), PoolError> {
        let page = &self.pages[idx.as_usize()];
        let gfn = page.gpa.gfn();
        let (prev, next) = (page.monitored_prev, page.monitored_next);

        let result = if !prev.is_nil() {
            self.pages[prev.as_usize()].monitored_next = next;
            if !next.is_nil() {
                self.pages[next.as_usize()].monitored_prev = prev;
            }

            Ok(())
        }
        else if !next.is_nil() {
            self.pages[next.as_usize()].monitored_prev = PoolIdx::NIL;
            tracing::trace!(%idx, %next, %gfn, "write handler handed over");
            self.driver.change_write_handler_owner(gfn, next)
        }
        else {
            tracing::trace!(%idx, %gfn, "write handler deregistered");
            self.driver.unregister_write_handler(gfn)
        };

        let page = &mut self.pages[idx.as_usize()];
        page.monitored_prev = PoolIdx::NIL;
        page.monitored_next = PoolIdx::NIL;
        page.flags.remove(PageFlags::MONITORED);
        self.modified_remove(idx);

        if let Err(err) = &result {
            tracing::error!(%idx, %gfn, %err, "failed to update write handler");
        }

        result
    }

    /// Flushes every page in the monitored chain of `gfn`.
    ///
    /// Locked pages stay.
    fn monitor_chain_flush(&mut self, gfn: Gfn) -> Result<(), PoolError> {
        let chain: SmallVec<[PoolIdx; 4]> = self.monitor_chain(gfn).collect();

        let mut result = Ok(());
        for idx in chain {
            if let Err(err) = self.flush_page(idx, true) {
                result = Err(err);
            }
        }

        self.stats.monitor_flushes += 1;
        result
    }

    /// Flushes every pool page shadowing the guest page containing `gpa`.
    ///
    /// Returns `false` if no pool page monitors the guest page.
    pub fn flush_guest_page(&mut self, gpa: Gpa) -> Result<bool, PoolError> {
        let gfn = gpa.gfn();
        if self.monitor_head(gfn).is_none() {
            return Ok(false);
        }

        tracing::debug!(%gpa, "unmonitoring guest page");
        self.monitor_chain_flush(gfn)?;
        Ok(true)
    }

    /// Returns the pool pages shadowing the guest page containing `gpa`,
    /// head first.
    pub fn monitored_pages(&self, gpa: Gpa) -> impl Iterator<Item = PoolIdx> + '_ {
        self.monitor_chain(gpa.gfn())
    }

    /// Handles a guest write to a monitored page.
    ///
    /// A plain store is patched into the shadows: every shadow entry it
    /// touches in every page of the monitored chain is invalidated. Pages
    /// that are written too often, writes that look like the guest reusing
    /// the table for something else, and writes that cannot be decoded end
    /// the monitoring instead: an eligible leaf page is parked on the dirty
    /// fast path, otherwise the whole chain is flushed.
    pub fn handle_write_fault(
        &mut self,
        fault: WriteFault,
    ) -> Result<WriteFaultOutcome, PoolError> {
        let gfn = fault.gpa.gfn();
        let Some(head) = self.monitor_head(gfn) else {
            return Ok(WriteFaultOutcome::NotMonitored);
        };

        self.access_seq += 1;
        let seq = self.access_seq;

        let page = &mut self.pages[head.as_usize()];
        let format = page.format;
        let locked = page.lock_count > 0;
        let max = format.max_modifications(self.config.dirty_tracking);

        let size = match fault.access {
            GuestWrite::Store { size } => Some(u64::from(size.max(1))),
            GuestWrite::Bulk | GuestWrite::Unsupported => None,
        };

        let mut force_flush = size.is_none();

        if let (Some(size), Some(last)) = (size, page.last_write.as_mut()) {
            let reused = fault.ip.abs_diff(last.ip) < REUSE_IP_DISTANCE
                && fault.gpa.0 == last.gpa.0.wrapping_add(size)
                && seq == last.seq + 1;

            //
            // Sequential stores walking the table from its start look like
            // the guest is initializing it for another purpose.
            //
            if reused {
                last.gpa = fault.gpa;
                last.seq = seq;

                page.modifications = page.modifications.saturating_mul(2);
                if page.modifications >= max && !locked {
                    tracing::debug!(%gfn, idx = %head, "guest table looks reused");
                    force_flush = true;
                }
            }
        }

        let below_threshold = locked || page.modifications < max;

        if let Some(size) = size.filter(|_| !force_flush && below_threshold) {
            self.patch_chain(gfn, fault.gpa.page_offset(), size);
            self.note_write(head, fault, seq);
            self.stats.monitor_handled += 1;

            tracing::trace!(gpa = %fault.gpa, idx = %head, size, "write patched");
            return Ok(WriteFaultOutcome::Handled);
        }

        if !force_flush
            && self.config.dirty_tracking
            && format.is_dirty_eligible()
            && self.add_dirty_page(head)?
        {
            return Ok(WriteFaultOutcome::DirtyTracked);
        }

        tracing::debug!(
            gpa = %fault.gpa,
            idx = %head,
            access = ?fault.access,
            "flushing monitored chain"
        );

        self.monitor_chain_flush(gfn)?;
        Ok(WriteFaultOutcome::Flushed)
    }

    /// Invalidates the shadow entries touched by a write in every page of
    /// the monitored chain of `gfn`.
    fn patch_chain(&mut self, gfn: Gfn, offset: u64, size: u64) {
        let chain: SmallVec<[PoolIdx; 4]> = self.monitor_chain(gfn).collect();

        for idx in chain {
            let page = &self.pages[idx.as_usize()];
            let slots = page
                .format
                .affected_entries(page.gpa.page_offset(), offset, size);

            for slot in slots {
                self.deref_entry(idx, slot);
            }
        }
    }

    /// Updates the modification and reuse tracking of a patched page.
    fn note_write(&mut self, idx: PoolIdx, fault: WriteFault, seq: u64) {
        let page = &mut self.pages[idx.as_usize()];
        let first = page.modifications == 0;
        page.modifications = page.modifications.saturating_add(1);

        if fault.gpa.page_offset() == 0 && page.lock_count == 0 {
            page.last_write = Some(LastWrite {
                gpa: fault.gpa,
                ip: fault.ip,
                seq,
            });

            if page.modifications > REUSE_MODIFICATIONS_CAP {
                page.modifications = 2;
            }
        }
        else if let Some(last) = page.last_write.as_mut().filter(|last| last.gpa == fault.gpa) {
            last.seq = seq;
        }
        else {
            page.last_write = None;
        }

        if first {
            self.modified_insert(idx);
        }
    }

    /// Inserts a page at the head of the modified list.
    pub(crate) fn modified_insert(&mut self, idx: PoolIdx) {
        let head = self.modified_head;

        let page = &mut self.pages[idx.as_usize()];
        page.modified_prev = PoolIdx::NIL;
        page.modified_next = head;

        if !head.is_nil() {
            self.pages[head.as_usize()].modified_prev = idx;
        }

        self.modified_head = idx;
        self.modified_pages += 1;
    }

    /// Removes a page from the modified list and clears its modification
    /// count.
    pub(crate) fn modified_remove(&mut self, idx: PoolIdx) {
        let page = &self.pages[idx.as_usize()];
        let (prev, next) = (page.modified_prev, page.modified_next);

        if prev.is_nil() && self.modified_head != idx {
            // Not on the list.
            self.pages[idx.as_usize()].modifications = 0;
            return;
        }

        if prev.is_nil() {
            self.modified_head = next;
        }
        else {
            self.pages[prev.as_usize()].modified_next = next;
        }

        if !next.is_nil() {
            self.pages[next.as_usize()].modified_prev = prev;
        }

        let page = &mut self.pages[idx.as_usize()];
        page.modified_prev = PoolIdx::NIL;
        page.modified_next = PoolIdx::NIL;
        page.modifications = 0;
        self.modified_pages -= 1;
    }

    /// Clears the modification count of every page on the modified list and
    /// empties it.
    pub(crate) fn modified_clear_all(&mut self) {
        let mut idx = std::mem::replace(&mut self.modified_head, PoolIdx::NIL);
        let mut cleared = 0u16;

        while !idx.is_nil() {
            let page = &mut self.pages[idx.as_usize()];
            let next = page.modified_next;
            page.modified_prev = PoolIdx::NIL;
            page.modified_next = PoolIdx::NIL;
            page.modifications = 0;
            page.last_write = None;

            cleared += 1;
            idx = next;
        }

        debug_assert_eq!(cleared, self.modified_pages);
        self.modified_pages = 0;
    }

    /// Returns the number of pages on the modified list.
    pub fn modified_pages(&self) -> u16 {
        self.modified_pages
    }
}
