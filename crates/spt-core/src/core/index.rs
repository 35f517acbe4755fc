use super::macros::impl_index;

impl_index!(PoolIdx, 0, "pool page; index 0 is reserved");
impl_index!(UserIdx, u16::MAX, "user record");
impl_index!(PhysExtIdx, u16::MAX, "physical extent node");

impl PoolIdx {
    /// The first usable pool page index.
    pub const FIRST: Self = Self(1);

    /// The highest pool page index the pool can address.
    pub const LAST: Self = Self(0x3fff);
}
