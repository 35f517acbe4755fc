use super::macros::impl_ops;

impl_ops!(Gfn, u64, "Guest Frame Number");
impl_ops!(Gpa, u64, "Guest Physical Address");
impl_ops!(HostFrame, u64, "Host Frame Number backing a pool page");

/// The page shift.
pub const PAGE_SHIFT: u64 = 12;

/// The page size.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// The page offset mask.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

impl Gpa {
    /// An unused guest physical address.
    pub const NIL: Self = Self(u64::MAX);

    /// Checks if this is the NIL address.
    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    /// Returns the guest frame number containing the address.
    pub fn gfn(self) -> Gfn {
        Gfn(self.0 >> PAGE_SHIFT)
    }

    /// Returns the offset of the address within its page.
    pub fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Returns the address rounded down to its page boundary.
    pub fn page_base(self) -> Self {
        Self(self.0 & !PAGE_OFFSET_MASK)
    }
}

impl Gfn {
    /// Returns the guest physical address of the first byte of the frame.
    pub fn gpa(self) -> Gpa {
        Gpa(self.0 << PAGE_SHIFT)
    }
}

impl From<Gfn> for Gpa {
    fn from(value: Gfn) -> Self {
        value.gpa()
    }
}
