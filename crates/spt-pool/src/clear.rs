//! Pool-wide resets.

use spt_core::{PoolBackend, PoolError, PoolIdx, UserIdx};

use crate::{DirtyTable, PagePool, user};

impl<Driver> PagePool<Driver>
where
    Driver: PoolBackend,
{
    /// Drops every guest mapping from the shadows while keeping the shadow
    /// hierarchies intact.
    ///
    /// Leaf pages are zeroed, every modification count is cleared, the alias
    /// tracking of all guest memory is erased, the dirty fast path is
    /// drained and all TLBs are invalidated. Calling it twice in a row is
    /// the same as calling it once.
    ///
    /// In a multi-processor guest this must only run while no other
    /// executor touches the pool; see [`SharedPagePool::clear_all`].
    ///
    /// [`SharedPagePool::clear_all`]: crate::SharedPagePool::clear_all
    pub fn clear_all(&mut self) -> Result<(), PoolError> {
        tracing::debug!(used = self.used_pages, "clearing all leaf pages");

        //
        // The dirty slots still reference guest mappings, drain them while
        // the alias tracking is intact.
        //
        let dirty_result = self.reset_dirty_pages();

        let mut wiped = 0usize;
        for page in self.pages.iter_mut().skip(1) {
            if page.is_used() && page.format.is_leaf() {
                if page.present_count > 0 {
                    wiped += 1;
                }

                page.wipe();
            }
        }

        self.modified_clear_all();

        self.driver.clear_all_phys_tracking()?;
        self.rebuild_phys_ext_free_list();

        self.flush_pending = false;
        self.driver.invalidate_all_tlbs();
        self.stats.clear_alls += 1;

        tracing::debug!(wiped, "pool cleared");
        dirty_result
    }

    /// Returns the pool to its freshly grown state.
    ///
    /// Every shadow page is destroyed and every write handler is
    /// deregistered. The backing pages are kept.
    pub fn reset(&mut self) -> Result<(), PoolError> {
        tracing::debug!(used = self.used_pages, "resetting pool");

        let result = self.unregister_all_handlers();

        self.dirty = DirtyTable::new();

        for page in self.pages.iter_mut().skip(1) {
            page.reinit_free();
            page.wipe();
        }

        self.free_head = PoolIdx::NIL;
        for raw in (1..self.pages.len()).rev() {
            self.pages[raw].hash_next = self.free_head;
            self.free_head = PoolIdx::new(raw as u16);
        }

        self.used_pages = 0;
        self.hash.fill(PoolIdx::NIL);
        self.age_head = PoolIdx::NIL;
        self.age_tail = PoolIdx::NIL;
        self.modified_head = PoolIdx::NIL;
        self.modified_pages = 0;

        self.users = user::new_user_arena(self.config.max_users);
        self.user_free_head = UserIdx::new(0);
        self.rebuild_phys_ext_free_list();

        self.flush_pending = false;
        self.access_seq = 0;

        self.driver.clear_all_phys_tracking()?;
        self.driver.invalidate_all_tlbs();

        result
    }

    /// Deregisters every write handler and hands the driver back.
    pub fn teardown(mut self) -> Result<Driver, PoolError> {
        tracing::debug!(used = self.used_pages, "tearing down pool");

        self.unregister_all_handlers()?;
        Ok(self.driver)
    }

    fn unregister_all_handlers(&mut self) -> Result<(), PoolError> {
        let mut result = Ok(());

        for page in self.pages.iter().skip(1) {
            if !page.is_monitored() || !page.monitored_prev.is_nil() {
                continue;
            }

            let gfn = page.gpa.gfn();
            if let Err(err) = self.driver.unregister_write_handler(gfn) {
                tracing::error!(%gfn, %err, "failed to deregister write handler");
                result = Err(err);
            }
        }

        result
    }
}
