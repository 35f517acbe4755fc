use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use spt_core::{PoolBackend, PoolError, Rendezvous};

use crate::PagePool;

/// A pool shared by the executors of one virtual machine.
///
/// Every operation takes one coarse lock. [`clear_all`] additionally parks
/// every executor at a [`Rendezvous`] so that none of them is in the middle
/// of walking a shadow table while the leaves are wiped.
///
/// [`clear_all`]: Self::clear_all
pub struct SharedPagePool<Driver>
where
    Driver: PoolBackend,
{
    inner: Mutex<PagePool<Driver>>,

    /// Outcome of the last synchronized clear, published to the executors
    /// that did not perform it.
    clear_failed: AtomicBool,
}

impl<Driver> SharedPagePool<Driver>
where
    Driver: PoolBackend,
{
    /// Wraps a pool.
    pub fn new(pool: PagePool<Driver>) -> Self {
        Self {
            inner: Mutex::new(pool),
            clear_failed: AtomicBool::new(false),
        }
    }

    /// Locks the pool.
    pub fn lock(&self) -> MutexGuard<'_, PagePool<Driver>> {
        self.inner.lock()
    }

    /// Unwraps the pool.
    pub fn into_inner(self) -> PagePool<Driver> {
        self.inner.into_inner()
    }

    /// Runs [`PagePool::clear_all`] once for all executors.
    ///
    /// Every executor taking part in `rendezvous` must call this. Exactly
    /// one of them performs the reset; the call returns `true` on that one
    /// and `false` on the others, after the reset is complete.
    ///
    /// If the reset fails, the performing executor gets the error itself and
    /// every other executor gets [`PoolError::ClearAllFailed`].
    pub fn clear_all(&self, rendezvous: &Rendezvous) -> Result<bool, PoolError> {
        let performed = rendezvous.run_exclusive(|| {
            let result = self.inner.lock().clear_all();
            self.clear_failed.store(result.is_err(), Ordering::Release);
            result
        });

        match performed {
            Some(result) => result.map(|()| true),
            None if self.clear_failed.load(Ordering::Acquire) => Err(PoolError::ClearAllFailed),
            None => Ok(false),
        }
    }
}
