use spt_arch_x86::{PageTableEntry, PoolAccess, PoolFormat};
use spt_core::{Gpa, HostFrame, PAGE_SIZE, PoolIdx, UserIdx};
use zerocopy::{FromBytes, IntoBytes};

bitflags::bitflags! {
    /// State flags of a pool page.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PageFlags: u8 {
        /// May be found by a cache probe.
        const CACHED = 0b00000001;

        /// Registered with the access monitor.
        const MONITORED = 0b00000010;

        /// Parked on the dirty fast path.
        const DIRTY = 0b00000100;

        /// The content is known to be all zeroes.
        const ZEROED = 0b00001000;

        /// Built while the guest had the A20 gate enabled.
        const A20 = 0b00010000;
    }
}

/// Slot value meaning "no entry".
pub(crate) const NIL_SLOT: u16 = u16::MAX;

/// The last write fault that hit a page, for reuse detection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LastWrite {
    pub gpa: Gpa,
    pub ip: u64,
    pub seq: u64,
}

/// A pool page: one shadow table plus its bookkeeping.
///
/// Pages are only handed out by reference through the pool's introspection
/// iterators; all mutation goes through [`PagePool`].
///
/// [`PagePool`]: crate::PagePool
pub struct PoolPage {
    pub(crate) idx: PoolIdx,
    pub(crate) format: PoolFormat,
    pub(crate) access: PoolAccess,
    pub(crate) gpa: Gpa,
    pub(crate) host_frame: HostFrame,
    pub(crate) flags: PageFlags,
    pub(crate) lock_count: u16,

    pub(crate) present_count: u16,
    pub(crate) first_present: u16,
    pub(crate) modifications: u16,
    pub(crate) dirty_slot: u8,
    pub(crate) last_write: Option<LastWrite>,

    /// Hash chain link, or free list link while the page is free.
    pub(crate) hash_next: PoolIdx,
    pub(crate) age_prev: PoolIdx,
    pub(crate) age_next: PoolIdx,
    pub(crate) modified_prev: PoolIdx,
    pub(crate) modified_next: PoolIdx,
    pub(crate) monitored_prev: PoolIdx,
    pub(crate) monitored_next: PoolIdx,
    pub(crate) user_head: UserIdx,

    pub(crate) content: Box<[u8]>,
}

impl PoolPage {
    /// The NIL page at index 0.
    pub(crate) fn nil() -> Self {
        Self::with_content(PoolIdx::NIL, HostFrame::default(), Box::default(), PoolFormat::Invalid)
    }

    /// A freshly grown, zeroed free page.
    pub(crate) fn new(idx: PoolIdx, host_frame: HostFrame) -> Self {
        let content = vec![0u8; PAGE_SIZE as usize].into_boxed_slice();
        let mut page = Self::with_content(idx, host_frame, content, PoolFormat::Free);
        page.flags = PageFlags::ZEROED;
        page
    }

    fn with_content(
        idx: PoolIdx,
        host_frame: HostFrame,
        content: Box<[u8]>,
        format: PoolFormat,
    ) -> Self {
        Self {
            idx,
            format,
            access: PoolAccess::DontCare,
            gpa: Gpa::NIL,
            host_frame,
            flags: PageFlags::empty(),
            lock_count: 0,
            present_count: 0,
            first_present: NIL_SLOT,
            modifications: 0,
            dirty_slot: 0,
            last_write: None,
            hash_next: PoolIdx::NIL,
            age_prev: PoolIdx::NIL,
            age_next: PoolIdx::NIL,
            modified_prev: PoolIdx::NIL,
            modified_next: PoolIdx::NIL,
            monitored_prev: PoolIdx::NIL,
            monitored_next: PoolIdx::NIL,
            user_head: UserIdx::NIL,
            content,
        }
    }

    /// Puts the page back into the free state, keeping its backing.
    pub(crate) fn reinit_free(&mut self) {
        self.format = PoolFormat::Free;
        self.access = PoolAccess::DontCare;
        self.gpa = Gpa::NIL;
        self.flags = PageFlags::empty();
        self.lock_count = 0;
        self.present_count = 0;
        self.first_present = NIL_SLOT;
        self.modifications = 0;
        self.dirty_slot = 0;
        self.last_write = None;
        self.hash_next = PoolIdx::NIL;
        self.age_prev = PoolIdx::NIL;
        self.age_next = PoolIdx::NIL;
        self.modified_prev = PoolIdx::NIL;
        self.modified_next = PoolIdx::NIL;
        self.monitored_prev = PoolIdx::NIL;
        self.monitored_next = PoolIdx::NIL;
        self.user_head = UserIdx::NIL;
    }

    /// Turns a free page into an empty shadow table.
    pub(crate) fn prepare(&mut self, format: PoolFormat, access: PoolAccess, gpa: Gpa, a20: bool) {
        if !self.flags.contains(PageFlags::ZEROED) {
            self.content.fill(0);
        }

        self.format = format;
        self.access = access;
        self.gpa = gpa;
        self.flags = if a20 {
            PageFlags::A20
        }
        else {
            PageFlags::empty()
        };
    }

    /// Zeroes the whole content.
    pub(crate) fn wipe(&mut self) {
        self.content.fill(0);
        self.present_count = 0;
        self.first_present = NIL_SLOT;
        self.flags |= PageFlags::ZEROED;
    }

    /// Returns the index of the page.
    pub fn index(&self) -> PoolIdx {
        self.idx
    }

    /// Returns the layout the page shadows.
    pub fn format(&self) -> PoolFormat {
        self.format
    }

    /// Returns the big page access attributes.
    pub fn access(&self) -> PoolAccess {
        self.access
    }

    /// Returns the guest physical address the page shadows.
    pub fn gpa(&self) -> Gpa {
        self.gpa
    }

    /// Returns the host frame backing the page.
    pub fn host_frame(&self) -> HostFrame {
        self.host_frame
    }

    /// Checks if the page holds a shadow table.
    pub fn is_used(&self) -> bool {
        !matches!(self.format, PoolFormat::Free | PoolFormat::Invalid)
    }

    /// Checks if the page may be found by a cache probe.
    pub fn is_cached(&self) -> bool {
        self.flags.contains(PageFlags::CACHED)
    }

    /// Checks if the page is registered with the access monitor.
    pub fn is_monitored(&self) -> bool {
        self.flags.contains(PageFlags::MONITORED)
    }

    /// Checks if the page is on the dirty fast path.
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }

    /// Checks if the page was built with the A20 gate enabled.
    pub fn a20_enabled(&self) -> bool {
        self.flags.contains(PageFlags::A20)
    }

    /// Returns the number of outstanding locks.
    pub fn lock_count(&self) -> u16 {
        self.lock_count
    }

    /// Returns the number of present shadow entries.
    pub fn present_count(&self) -> u16 {
        self.present_count
    }

    /// Returns the lowest present entry index.
    pub fn first_present(&self) -> Option<u16> {
        (self.first_present != NIL_SLOT).then_some(self.first_present)
    }

    /// Returns the number of tracked guest writes.
    pub fn modifications(&self) -> u16 {
        self.modifications
    }

    /// Checks if any shadow entry references the page.
    pub fn has_users(&self) -> bool {
        !self.user_head.is_nil()
    }

    /// Returns the raw shadow content.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Returns a raw shadow entry.
    pub fn entry(&self, slot: usize) -> u64 {
        let size = self.format.entry_size();
        let Some(bytes) = self.content.get(slot * size..(slot + 1) * size) else {
            return 0;
        };

        match size {
            4 => u32::read_from_bytes(bytes).map_or(0, u64::from),
            _ => PageTableEntry::read_from_bytes(bytes).map_or(0, |entry| entry.0),
        }
    }

    /// Checks if a shadow entry is present.
    pub fn entry_present(&self, slot: usize) -> bool {
        self.format.entry_present(self.entry(slot))
    }

    /// Stores a raw shadow entry without touching the present bookkeeping.
    pub(crate) fn store_entry(&mut self, slot: usize, raw: u64) {
        let size = self.format.entry_size();
        let Some(bytes) = self.content.get_mut(slot * size..(slot + 1) * size) else {
            return;
        };

        match size {
            4 => bytes.copy_from_slice((raw as u32).as_bytes()),
            _ => bytes.copy_from_slice(PageTableEntry(raw).as_bytes()),
        }

        if raw != 0 {
            self.flags.remove(PageFlags::ZEROED);
        }
    }

    /// Records a newly present entry.
    pub(crate) fn note_present(&mut self, slot: u16) {
        self.present_count += 1;
        if self.first_present == NIL_SLOT || slot < self.first_present {
            self.first_present = slot;
        }
    }

    /// Records a no longer present entry.
    pub(crate) fn note_absent(&mut self, slot: u16) {
        debug_assert!(self.present_count > 0);
        self.present_count = self.present_count.saturating_sub(1);

        if self.present_count == 0 {
            self.first_present = NIL_SLOT;
        }
        else if slot == self.first_present {
            let count = self.format.entry_count();
            self.first_present = (slot as usize + 1..count)
                .find(|&next| self.entry_present(next))
                .map_or(NIL_SLOT, |next| next as u16);
        }
    }

    /// Checks the present bookkeeping invariant.
    pub(crate) fn present_consistent(&self) -> bool {
        (self.present_count == 0) == (self.first_present == NIL_SLOT)
    }
}

impl std::fmt::Debug for PoolPage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PoolPage")
            .field("idx", &self.idx)
            .field("format", &self.format)
            .field("gpa", &self.gpa)
            .field("flags", &self.flags)
            .field("lock_count", &self.lock_count)
            .field("present_count", &self.present_count)
            .field("modifications", &self.modifications)
            .finish()
    }
}
