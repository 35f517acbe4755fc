use serde::{Deserialize, Serialize};

/// Describes the virtual machine a pool is created for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolInfo {
    /// Configured guest RAM size in bytes.
    pub ram_size: u64,

    /// The number of virtual CPUs.
    pub vcpus: u16,
}
