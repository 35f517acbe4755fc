//! Collaborator traits.
//!
//! The pool does not own guest memory, the physical memory map, the trap
//! delivery machinery or the host allocator. It reaches all of them through
//! the traits in this module, which a hypervisor implements on a single
//! driver type.

use crate::{Gfn, HostFrame, PhysTracking, PoolError, PoolIdx, PoolInfo};

/// A trait for implementing a pool driver.
pub trait PoolDriver {
    /// Retrieves information about the virtual machine.
    fn info(&self) -> Result<PoolInfo, PoolError>;
}

/// Privileged backing allocator.
pub trait PoolGrow: PoolDriver {
    /// Commits up to `count` additional host pages for the pool.
    ///
    /// Returning fewer frames than requested is not an error.
    fn grow(&self, count: u16) -> Result<Vec<HostFrame>, PoolError>;
}

/// RAM metadata store.
pub trait PoolPhysTracking: PoolDriver {
    /// Returns the alias tracking field of a guest physical page.
    fn phys_tracking(&self, gfn: Gfn) -> Result<PhysTracking, PoolError>;

    /// Stores the alias tracking field of a guest physical page.
    fn set_phys_tracking(&self, gfn: Gfn, tracking: PhysTracking) -> Result<(), PoolError>;

    /// Erases the alias tracking field of every guest physical page.
    fn clear_all_phys_tracking(&self) -> Result<(), PoolError>;

    /// Returns the host frame backing a guest physical page.
    fn host_frame(&self, gfn: Gfn) -> Result<HostFrame, PoolError>;

    /// Returns the guest physical page backed by a host frame, if any.
    fn guest_frame(&self, host: HostFrame) -> Option<Gfn>;
}

/// Write-protection registrations for monitored guest pages.
pub trait PoolAccessHandler: PoolDriver {
    /// Starts trapping writes to `gfn` on behalf of pool page `owner`.
    fn register_write_handler(&self, gfn: Gfn, owner: PoolIdx) -> Result<(), PoolError>;

    /// Stops trapping writes to `gfn`.
    fn unregister_write_handler(&self, gfn: Gfn) -> Result<(), PoolError>;

    /// Hands the registration for `gfn` over to another pool page.
    fn change_write_handler_owner(&self, gfn: Gfn, owner: PoolIdx) -> Result<(), PoolError>;

    /// Re-arms write protection after it was temporarily disabled.
    fn reset_write_handler(&self, gfn: Gfn) -> Result<(), PoolError>;

    /// Temporarily lets guest writes to `gfn` through without trapping.
    fn temp_off_write_handler(&self, gfn: Gfn) -> Result<(), PoolError>;
}

/// Guest memory access.
pub trait PoolGuestRead: PoolDriver {
    /// Reads a page of guest physical memory.
    fn read_guest_page(&self, gfn: Gfn) -> Result<Vec<u8>, PoolError>;
}

/// Translation cache control.
pub trait PoolTlb: PoolDriver {
    /// Requests a TLB invalidation on every virtual CPU.
    fn invalidate_all_tlbs(&self);
}

/// Everything the pool needs from its environment.
pub trait PoolBackend:
    PoolGrow + PoolPhysTracking + PoolAccessHandler + PoolGuestRead + PoolTlb
{
}

impl<T> PoolBackend for T where
    T: PoolGrow + PoolPhysTracking + PoolAccessHandler + PoolGuestRead + PoolTlb
{
}
