//! Read-only introspection.

use spt_core::{PoolBackend, PoolIdx};

use crate::{PagePool, PoolPage};

impl<Driver> PagePool<Driver>
where
    Driver: PoolBackend,
{
    /// Returns the page at `idx` if it holds a shadow table.
    pub fn page(&self, idx: PoolIdx) -> Option<&PoolPage> {
        self.used_page(idx).ok()
    }

    /// Returns every page holding a shadow table, in index order.
    pub fn pages(&self) -> impl Iterator<Item = &PoolPage> + '_ {
        self.pages.iter().skip(1).filter(|page| page.is_used())
    }

    /// Returns every page at the top of a shadow hierarchy.
    pub fn root_pages(&self) -> impl Iterator<Item = &PoolPage> + '_ {
        self.pages().filter(|page| page.format.is_root())
    }
}
