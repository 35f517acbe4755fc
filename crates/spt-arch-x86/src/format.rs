use std::ops::Range;

use serde::{Deserialize, Serialize};
use spt_core::{HostFrame, PAGE_SIZE};

use crate::paging::{EntryFlags, PagingMode};

/// The layout a pool page shadows.
///
/// Every per-layout decision the pool makes goes through the methods of this
/// type: entry size and count, whether entries map guest memory directly,
/// whether the guest table behind the page is write-monitored, and which
/// cached layouts may be recycled for which requested ones.
///
/// Naming is `<shadow>For<guest>`: `PaePtFor32Pt` is a PAE page table
/// shadowing a 32-bit guest page table, `...ForPhys` shadows a
/// physical range with no guest table behind it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolFormat {
    /// The NIL page.
    #[default]
    Invalid,

    /// Unused pool page.
    Free,

    /// 32-bit PT for a physical range.
    Pt32ForPhys,
    /// 32-bit PT for a 32-bit guest PT.
    Pt32For32Pt,
    /// 32-bit PT for a 4MB guest page.
    Pt32For4Mb,
    /// PAE PT for a physical range.
    PaePtForPhys,
    /// PAE PT for half of a 32-bit guest PT.
    PaePtFor32Pt,
    /// PAE PT for half of a 4MB guest page.
    PaePtFor4Mb,
    /// PAE PT for a PAE guest PT.
    PaePtForPaePt,
    /// PAE PT for a 2MB guest page.
    PaePtFor2Mb,

    /// 32-bit PD for a 32-bit guest PD.
    Pd32,
    /// 32-bit PD for a physical range.
    Pd32Phys,
    /// PAE PD for the first quarter of a 32-bit guest PD.
    PaePd0For32Pd,
    /// PAE PD for the second quarter of a 32-bit guest PD.
    PaePd1For32Pd,
    /// PAE PD for the third quarter of a 32-bit guest PD.
    PaePd2For32Pd,
    /// PAE PD for the fourth quarter of a 32-bit guest PD.
    PaePd3For32Pd,
    /// PAE PD for a PAE guest PD.
    PaePdForPaePd,
    /// PAE PD for a physical range.
    PaePdPhys,

    /// PAE PDPT for a 32-bit guest.
    PaePdptFor32,
    /// PAE PDPT for a PAE guest PDPT.
    PaePdpt,
    /// PAE PDPT for a physical range.
    PaePdptPhys,

    /// Long mode PDPT for a long mode guest PDPT.
    Pdpt64For64,
    /// Long mode PDPT for a physical range.
    Pdpt64ForPhys,
    /// Long mode PD for a long mode guest PD.
    Pd64For64,
    /// Long mode PD for a physical range.
    Pd64ForPhys,
    /// Long mode PML4 for a long mode guest PML4.
    Pml4,

    /// EPT PDPT for a physical range.
    EptPdptForPhys,
    /// EPT PD for a physical range.
    EptPdForPhys,
    /// EPT PT for a physical range.
    EptPtForPhys,

    /// Nested paging root.
    RootNested,
}

/// Access attributes of a big page mapping.
///
/// Two shadows of the same guest big page with different attributes are
/// different cache entries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolAccess {
    /// Not a big page mapping.
    #[default]
    DontCare,
    /// User, read/write.
    UserRw,
    /// User, read-only.
    UserR,
    /// User, read/write, no-execute.
    UserRwNx,
    /// User, read-only, no-execute.
    UserRNx,
    /// Supervisor, read/write.
    SupervisorRw,
    /// Supervisor, read-only.
    SupervisorR,
    /// Supervisor, read/write, no-execute.
    SupervisorRwNx,
    /// Supervisor, read-only, no-execute.
    SupervisorRNx,
}

impl PoolFormat {
    /// Returns the entry encoding of the shadow table.
    pub fn paging_mode(self) -> PagingMode {
        match self {
            Self::Pt32ForPhys
            | Self::Pt32For32Pt
            | Self::Pt32For4Mb
            | Self::Pd32
            | Self::Pd32Phys => PagingMode::Legacy,

            Self::EptPdptForPhys | Self::EptPdForPhys | Self::EptPtForPhys => PagingMode::Ept,

            _ => PagingMode::Pae,
        }
    }

    /// Returns the size of one shadow entry in bytes.
    pub fn entry_size(self) -> usize {
        self.paging_mode().entry_size()
    }

    /// Returns the number of entries in the shadow table.
    pub fn entry_count(self) -> usize {
        match self {
            Self::Invalid | Self::Free => 0,
            Self::PaePdptFor32 | Self::PaePdpt | Self::PaePdptPhys => 4,
            _ => PAGE_SIZE as usize / self.entry_size(),
        }
    }

    /// Returns the size of one guest entry, or `None` when there is no guest
    /// table behind the shadow.
    pub fn guest_entry_size(self) -> Option<usize> {
        match self {
            Self::Pt32For32Pt | Self::PaePtFor32Pt => Some(4),
            Self::Pd32
            | Self::PaePd0For32Pd
            | Self::PaePd1For32Pd
            | Self::PaePd2For32Pd
            | Self::PaePd3For32Pd => Some(4),
            Self::PaePtForPaePt
            | Self::PaePdForPaePd
            | Self::PaePdpt
            | Self::Pdpt64For64
            | Self::Pd64For64
            | Self::Pml4 => Some(8),
            _ => None,
        }
    }

    /// Returns how many bytes of the guest table one shadow table covers.
    pub fn guest_window_len(self) -> u64 {
        match self {
            Self::PaePtFor32Pt => PAGE_SIZE / 2,
            Self::PaePd0For32Pd
            | Self::PaePd1For32Pd
            | Self::PaePd2For32Pd
            | Self::PaePd3For32Pd => PAGE_SIZE / 4,
            Self::PaePdpt => 32,
            _ => PAGE_SIZE,
        }
    }

    /// Returns the byte offset of the guest window for formats that cover a
    /// fixed part of the guest table.
    pub fn guest_window_start(self) -> Option<u64> {
        match self {
            Self::PaePd0For32Pd => Some(0),
            Self::PaePd1For32Pd => Some(PAGE_SIZE / 4),
            Self::PaePd2For32Pd => Some(PAGE_SIZE / 2),
            Self::PaePd3For32Pd => Some(3 * PAGE_SIZE / 4),
            _ => None,
        }
    }

    /// Checks if the shadow entries map guest memory directly.
    pub fn is_leaf(self) -> bool {
        matches!(
            self,
            Self::Pt32ForPhys
                | Self::Pt32For32Pt
                | Self::Pt32For4Mb
                | Self::PaePtForPhys
                | Self::PaePtFor32Pt
                | Self::PaePtFor4Mb
                | Self::PaePtForPaePt
                | Self::PaePtFor2Mb
                | Self::EptPtForPhys
        )
    }

    /// Checks if the shadow mirrors a guest big page.
    pub fn is_big_page(self) -> bool {
        matches!(
            self,
            Self::Pt32For4Mb | Self::PaePtFor4Mb | Self::PaePtFor2Mb
        )
    }

    /// Checks if the guest table behind the shadow is write-monitored.
    pub fn is_monitored(self) -> bool {
        matches!(
            self,
            Self::Pt32For32Pt
                | Self::PaePtFor32Pt
                | Self::PaePdForPaePd
                | Self::PaePtForPaePt
                | Self::Pd64For64
                | Self::Pdpt64For64
                | Self::Pml4
                | Self::PaePd0For32Pd
                | Self::PaePd1For32Pd
                | Self::PaePd2For32Pd
                | Self::PaePd3For32Pd
                | Self::Pd32
                | Self::PaePdpt
        )
    }

    /// Checks if the shadow sits at the top of a hierarchy.
    pub fn is_root(self) -> bool {
        matches!(
            self,
            Self::Pd32
                | Self::Pd32Phys
                | Self::PaePdptFor32
                | Self::PaePdpt
                | Self::PaePdptPhys
                | Self::Pml4
                | Self::RootNested
        )
    }

    /// Checks if heavy guest writes may be absorbed by leaving the guest
    /// table writable for a while.
    pub fn is_dirty_eligible(self) -> bool {
        matches!(self, Self::PaePtForPaePt | Self::PaePtFor32Pt)
    }

    /// Returns the maximum number of tracked guest writes before the pool
    /// stops patching and flushes.
    pub fn max_modifications(self, dirty_tracking: bool) -> u16 {
        match (dirty_tracking, self.is_dirty_eligible()) {
            (true, true) => 4,
            (true, false) => 24,
            (false, _) => 48,
        }
    }

    /// Checks if a cached page of this format found for the guest address of
    /// a `requested` allocation means the guest table was recycled, so the
    /// cached page must be flushed.
    pub fn reused_by(self, requested: Self) -> bool {
        match self {
            //
            // No remapping in non-paging mode.
            //
            Self::Pt32ForPhys
            | Self::Pd32Phys
            | Self::PaePtForPhys
            | Self::PaePdPhys
            | Self::PaePdptPhys
            | Self::Pdpt64ForPhys
            | Self::Pd64ForPhys
            | Self::EptPtForPhys
            | Self::EptPdForPhys
            | Self::EptPdptForPhys
            | Self::PaePdptFor32 => false,

            Self::PaePtFor4Mb
            | Self::Pt32For4Mb
            | Self::Pt32For32Pt
            | Self::PaePtFor32Pt
            | Self::PaePd0For32Pd
            | Self::PaePd1For32Pd
            | Self::PaePd2For32Pd
            | Self::PaePd3For32Pd
            | Self::Pd32
            | Self::PaePdpt => matches!(
                requested,
                Self::PaePdForPaePd
                    | Self::PaePtForPaePt
                    | Self::Pd64For64
                    | Self::Pdpt64For64
                    | Self::Pml4
                    | Self::PaePtFor2Mb
                    | Self::Pt32ForPhys
                    | Self::PaePtForPhys
                    | Self::Pdpt64ForPhys
                    | Self::Pd64ForPhys
                    | Self::EptPdptForPhys
                    | Self::EptPdForPhys
                    | Self::EptPtForPhys
            ),

            Self::PaePdForPaePd
            | Self::PaePtForPaePt
            | Self::Pd64For64
            | Self::Pdpt64For64
            | Self::Pml4
            | Self::PaePtFor2Mb => matches!(
                requested,
                Self::PaePtFor4Mb
                    | Self::Pt32For4Mb
                    | Self::Pt32For32Pt
                    | Self::PaePtFor32Pt
                    | Self::PaePd0For32Pd
                    | Self::PaePd1For32Pd
                    | Self::PaePd2For32Pd
                    | Self::PaePd3For32Pd
                    | Self::Pt32ForPhys
                    | Self::PaePtForPhys
                    | Self::Pdpt64ForPhys
                    | Self::Pd64ForPhys
                    | Self::EptPdptForPhys
                    | Self::EptPdForPhys
                    | Self::EptPtForPhys
            ),

            Self::RootNested | Self::Invalid | Self::Free => false,
        }
    }

    /// Checks if a raw shadow entry is present.
    pub fn entry_present(self, raw: u64) -> bool {
        self.paging_mode().present(raw)
    }

    /// Returns the host frame a raw shadow entry points at.
    pub fn entry_target(self, raw: u64) -> HostFrame {
        self.paging_mode().frame(raw)
    }

    /// Checks if a shadow entry of this format can point at `frame`.
    pub fn can_address(self, frame: HostFrame) -> bool {
        self.paging_mode().can_address(frame)
    }

    /// Builds a present shadow entry pointing at `frame`.
    pub fn make_entry(self, frame: HostFrame, writable: bool) -> u64 {
        let mut flags = EntryFlags::PRESENT | EntryFlags::USER;
        if writable {
            flags |= EntryFlags::WRITE;
        }

        self.paging_mode().make_entry(frame, flags)
    }

    /// Returns the shadow entries affected by a guest write of `size` bytes
    /// at `offset` within the guest page.
    ///
    /// `window_start` is the byte offset of the part of the guest table this
    /// shadow covers.
    pub fn affected_entries(self, window_start: u64, offset: u64, size: u64) -> Range<usize> {
        let Some(guest_entry_size) = self.guest_entry_size() else {
            return 0..0;
        };

        let guest_entry_size = guest_entry_size as u64;
        let window_start = self.guest_window_start().unwrap_or(window_start);
        let window_end = window_start + self.guest_window_len();

        let start = offset.max(window_start);
        let end = (offset + size.max(1)).min(window_end);
        if start >= end {
            return 0..0;
        }

        // A 32-bit guest PDE maps 4MB, which takes two PAE PDEs.
        let ratio = match self {
            Self::PaePd0For32Pd
            | Self::PaePd1For32Pd
            | Self::PaePd2For32Pd
            | Self::PaePd3For32Pd => 2,
            _ => 1,
        };

        let first = ((start - window_start) / guest_entry_size) as usize * ratio;
        let last = ((end - 1 - window_start) / guest_entry_size) as usize * ratio + ratio;
        first..last.min(self.entry_count())
    }

    /// Returns a short human readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Free => "free",
            Self::Pt32ForPhys => "32-bit PT for phys",
            Self::Pt32For32Pt => "32-bit PT for 32-bit PT",
            Self::Pt32For4Mb => "32-bit PT for 4MB page",
            Self::PaePtForPhys => "PAE PT for phys",
            Self::PaePtFor32Pt => "PAE PT for 32-bit PT",
            Self::PaePtFor4Mb => "PAE PT for 4MB page",
            Self::PaePtForPaePt => "PAE PT for PAE PT",
            Self::PaePtFor2Mb => "PAE PT for 2MB page",
            Self::Pd32 => "32-bit PD",
            Self::Pd32Phys => "32-bit PD for phys",
            Self::PaePd0For32Pd => "PAE PD0 for 32-bit PD",
            Self::PaePd1For32Pd => "PAE PD1 for 32-bit PD",
            Self::PaePd2For32Pd => "PAE PD2 for 32-bit PD",
            Self::PaePd3For32Pd => "PAE PD3 for 32-bit PD",
            Self::PaePdForPaePd => "PAE PD for PAE PD",
            Self::PaePdPhys => "PAE PD for phys",
            Self::PaePdptFor32 => "PAE PDPT for 32-bit",
            Self::PaePdpt => "PAE PDPT",
            Self::PaePdptPhys => "PAE PDPT for phys",
            Self::Pdpt64For64 => "64-bit PDPT",
            Self::Pdpt64ForPhys => "64-bit PDPT for phys",
            Self::Pd64For64 => "64-bit PD",
            Self::Pd64ForPhys => "64-bit PD for phys",
            Self::Pml4 => "64-bit PML4",
            Self::EptPdptForPhys => "EPT PDPT for phys",
            Self::EptPdForPhys => "EPT PD for phys",
            Self::EptPtForPhys => "EPT PT for phys",
            Self::RootNested => "nested root",
        }
    }
}

impl std::fmt::Display for PoolFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_geometry() {
        assert_eq!(PoolFormat::Pt32For32Pt.entry_count(), 1024);
        assert_eq!(PoolFormat::PaePtForPaePt.entry_count(), 512);
        assert_eq!(PoolFormat::PaePdpt.entry_count(), 4);
        assert_eq!(PoolFormat::Free.entry_count(), 0);
        assert_eq!(PoolFormat::EptPtForPhys.entry_size(), 8);
    }

    #[test]
    fn phys_formats_are_neither_monitored_nor_reused() {
        for format in [
            PoolFormat::Pt32ForPhys,
            PoolFormat::PaePtForPhys,
            PoolFormat::EptPtForPhys,
            PoolFormat::PaePdptFor32,
        ] {
            assert!(!format.is_monitored());
            assert!(!format.reused_by(PoolFormat::PaePtForPaePt));
        }
    }

    #[test]
    fn mode_switch_recycles_guest_tables() {
        assert!(PoolFormat::Pt32For32Pt.reused_by(PoolFormat::PaePtForPaePt));
        assert!(PoolFormat::PaePtForPaePt.reused_by(PoolFormat::PaePtFor32Pt));
        assert!(!PoolFormat::PaePtForPaePt.reused_by(PoolFormat::PaePdForPaePd));
        assert!(!PoolFormat::RootNested.reused_by(PoolFormat::Pml4));
    }

    #[test]
    fn affected_entries_same_size() {
        let format = PoolFormat::PaePtForPaePt;
        assert_eq!(format.affected_entries(0, 0x10, 8), 2..3);
        assert_eq!(format.affected_entries(0, 0x14, 8), 2..4);
        assert_eq!(format.affected_entries(0, 0xff8, 8), 511..512);
    }

    #[test]
    fn affected_entries_half_window() {
        let format = PoolFormat::PaePtFor32Pt;
        assert_eq!(format.affected_entries(0, 0x800, 4), 0..0);
        assert_eq!(format.affected_entries(0x800, 0x804, 4), 1..2);
        assert_eq!(format.affected_entries(0x800, 0x7fc, 4), 0..0);
    }

    #[test]
    fn affected_entries_quarter_pd() {
        let format = PoolFormat::PaePd1For32Pd;
        assert_eq!(format.affected_entries(0, 0x400, 4), 0..2);
        assert_eq!(format.affected_entries(0, 0x7fc, 4), 510..512);
        assert_eq!(format.affected_entries(0, 0x3fc, 4), 0..0);
    }

    #[test]
    fn unmonitored_formats_have_no_affected_entries() {
        assert_eq!(PoolFormat::PaePtForPhys.affected_entries(0, 0, 8), 0..0);
    }
}
