mod address;
mod alloc_flags;
mod index;
mod info;
pub(crate) mod macros;

pub use self::{
    address::{Gfn, Gpa, HostFrame, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE},
    alloc_flags::AllocFlags,
    index::{PhysExtIdx, PoolIdx, UserIdx},
    info::PoolInfo,
};
