//! A shadow page-table pool for software-paging hypervisors.
//!
//! A hypervisor that virtualizes the guest MMU in software keeps shadow
//! copies of the guest page tables. This crate manages the memory those
//! shadows live in: allocation, caching by guest physical address,
//! reference and alias tracking, write monitoring of the guest tables and
//! synchronized resets.
//!
//! The crate is split into:
//!
//! - [`spt_core`]: address types, arena indices, configuration, errors and
//!   the collaborator traits a hypervisor implements.
//! - [`arch`]: the x86 shadow table formats.
//! - [`pool`]: the pool itself.
//!
//! # Example
//!
//! ```no_run
//! # use spt::{AllocFlags, Gpa, PoolConfig, PoolError, PoolBackend};
//! # use spt::arch::{PoolAccess, PoolFormat};
//! # use spt::pool::{PagePool, PoolAlloc};
//! # fn example<Driver: PoolBackend>(driver: Driver) -> Result<(), PoolError> {
//! let info = driver.info()?;
//! let config = PoolConfig::from_ram_size(info.ram_size);
//! let mut pool = PagePool::new(driver, config)?;
//!
//! let root = pool.alloc(
//!     Gpa(0x1000),
//!     PoolFormat::Pml4,
//!     PoolAccess::DontCare,
//!     None,
//!     AllocFlags::LOCK,
//! )?;
//!
//! if let PoolAlloc::New(idx) = root {
//!     // Fill in the new shadow table.
//!     # let _ = idx;
//! }
//! # Ok(())
//! # }
//! ```

pub use spt_core::*;

/// x86 shadow table formats.
#[cfg(feature = "arch-x86")]
pub mod arch {
    pub use spt_arch_x86::*;
}

/// The shadow page-table pool.
#[cfg(feature = "pool")]
pub mod pool {
    pub use spt_pool::*;
}
