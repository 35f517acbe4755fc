use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use spt_core::HostFrame;

bitflags::bitflags! {
    /// Flags of a shadow paging entry.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        /// Present (read access for EPT).
        const PRESENT = 1 << 0;

        /// Writable (write access for EPT).
        const WRITE = 1 << 1;

        /// User accessible (execute access for EPT).
        const USER = 1 << 2;

        /// Large page.
        const LARGE = 1 << 7;
    }
}

/// Supported shadow paging modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// 32-bit paging (4-byte entries).
    Legacy,

    /// Physical Address Extension and long mode (8-byte entries).
    Pae,

    /// Extended page tables (8-byte entries, RWX permission bits).
    Ept,
}

impl PagingMode {
    const LEGACY_FRAME_MASK: u64 = 0xf_ffff;

    /// Returns the size of one entry in bytes.
    pub fn entry_size(self) -> usize {
        match self {
            Self::Legacy => 4,
            Self::Pae => 8,
            Self::Ept => 8,
        }
    }

    /// Checks if a raw entry is present.
    pub fn present(self, raw: u64) -> bool {
        match self {
            Self::Legacy | Self::Pae => raw & 1 != 0,
            Self::Ept => raw & 0b111 != 0,
        }
    }

    /// Returns the highest host frame an entry can point at.
    pub fn max_frame(self) -> HostFrame {
        match self {
            Self::Legacy => HostFrame::new(Self::LEGACY_FRAME_MASK),
            Self::Pae | Self::Ept => HostFrame::new(PageTableEntry::FRAME_MASK),
        }
    }

    /// Checks if an entry can point at `frame`.
    pub fn can_address(self, frame: HostFrame) -> bool {
        frame <= self.max_frame()
    }

    /// Extracts the host frame from a raw entry.
    pub fn frame(self, raw: u64) -> HostFrame {
        match self {
            Self::Legacy => HostFrame::new((raw >> 12) & Self::LEGACY_FRAME_MASK),
            Self::Pae | Self::Ept => PageTableEntry(raw).frame(),
        }
    }

    /// Builds a raw entry pointing at `frame`.
    ///
    /// Frame bits the entry cannot hold are dropped; check
    /// [`can_address`](Self::can_address) first.
    pub fn make_entry(self, frame: HostFrame, flags: EntryFlags) -> u64 {
        let flags = match self {
            Self::Legacy | Self::Pae => flags.bits(),
            Self::Ept => {
                // EPT has no present bit; any access permission makes the entry valid.
                (flags | EntryFlags::WRITE | EntryFlags::USER).bits()
            }
        };

        match self {
            Self::Legacy => ((frame.0 & Self::LEGACY_FRAME_MASK) << 12) | (flags & 0xfff),
            Self::Pae | Self::Ept => PageTableEntry::new(frame, flags).0,
        }
    }
}

/// An 8-byte shadow paging entry.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    const FRAME_BITS: u64 = 40;
    const FRAME_MASK: u64 = (1 << Self::FRAME_BITS) - 1;

    /// Creates an entry from a frame and the low flag bits.
    pub fn new(frame: HostFrame, flags: u64) -> Self {
        Self(((frame.0 & Self::FRAME_MASK) << 12) | (flags & 0xfff))
    }

    /// Checks if the entry is present.
    pub fn present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if the entry is writable.
    pub fn write(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }

    /// Checks if this entry refers to a large page.
    pub fn large(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Extracts the host frame number from the entry.
    pub fn frame(self) -> HostFrame {
        HostFrame::new((self.0 >> 12) & Self::FRAME_MASK)
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("large", &self.large())
            .field("frame", &self.frame())
            .finish()
    }
}
