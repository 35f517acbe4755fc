use crate::{Gfn, HostFrame, PoolIdx};

/// The pool resource that ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Pool pages.
    Pages,

    /// User records.
    Users,

    /// Physical extent nodes.
    PhysExts,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Pages => f.write_str("pool pages"),
            Self::Users => f.write_str("user records"),
            Self::PhysExts => f.write_str("physical extents"),
        }
    }
}

/// An error that can occur when working with the pool.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// An error occurred in one of the pool collaborators.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// No free element was left and nothing could be evicted.
    ///
    /// The caller is expected to perform a full flush and retry.
    #[error("Out of {0}")]
    ResourceExhausted(Resource),

    /// The backing allocator failed while the pool was below its minimal
    /// viable size.
    #[error("Backing allocation failed ({current} of {minimum} pages)")]
    AllocationFailed {
        /// Pages the pool currently holds.
        current: u16,

        /// Pages the pool needs to operate.
        minimum: u16,
    },

    /// Internal bookkeeping is inconsistent.
    #[error("Invariant violation: {0}")]
    InvariantViolation(&'static str),

    /// The given pool index does not refer to an allocated page.
    #[error("Invalid pool index {0}")]
    InvalidIndex(PoolIdx),

    /// The guest frame is not backed by guest RAM.
    #[error("Guest frame {0} is not RAM")]
    NotRam(Gfn),

    /// The host frame is out of reach of the shadow entry format.
    #[error("Host frame {0} cannot be addressed by the shadow entry")]
    FrameOutOfReach(HostFrame),

    /// A synchronized clear failed on the executor that performed it.
    #[error("Clearing the pool failed on another executor")]
    ClearAllFailed,

    /// The configuration is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,
}

impl PoolError {
    /// Wraps a collaborator error.
    pub fn driver(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Driver(Box::new(err))
    }
}
