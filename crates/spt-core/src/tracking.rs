use serde::{Deserialize, Serialize};

use crate::{PhysExtIdx, PoolIdx};

/// A reference from a shadow entry to a guest physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysRef {
    /// The pool page holding the shadow entry.
    pub page: PoolIdx,

    /// The entry index within the pool page.
    pub slot: u16,
}

impl PhysRef {
    /// Creates a new reference.
    pub fn new(page: PoolIdx, slot: u16) -> Self {
        Self { page, slot }
    }
}

/// Per guest physical page alias tracking.
///
/// The field is stored by the RAM metadata collaborator. The pool is its only
/// writer and the collaborator must not interpret it.
///
/// The first reference is kept inline. Further references are stored in a
/// chain of physical extents rooted at `extents`. Once the chain could not be
/// extended the field is marked as overflowed and no longer tracks individual
/// references.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysTracking {
    /// The inline reference.
    pub inline: Option<PhysRef>,

    /// Head of the extent chain.
    pub extents: PhysExtIdx,

    /// The references are too many to track.
    pub overflowed: bool,
}

impl PhysTracking {
    /// Checks if the field tracks no references.
    pub fn is_empty(&self) -> bool {
        self.inline.is_none() && self.extents.is_nil() && !self.overflowed
    }
}
