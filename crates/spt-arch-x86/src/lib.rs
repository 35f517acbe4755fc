//! x86 shadow table formats.
//!
//! [`PoolFormat`] is the closed set of shadow table layouts the pool knows
//! about, together with everything the pool needs to know per layout.
//! [`PagingMode`] and [`PageTableEntry`] decode and build raw entries.

mod format;
mod paging;

pub use self::{
    format::{PoolAccess, PoolFormat},
    paging::{EntryFlags, PageTableEntry, PagingMode},
};
