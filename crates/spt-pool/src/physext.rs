//! Alias tracking of guest physical pages.
//!
//! The tracking field of a guest page lives in the RAM metadata store and is
//! read and written through [`PoolPhysTracking`]. The first reference is kept
//! inline, the rest in a chain of [`PhysExtent`] nodes owned by the pool.
//!
//! [`PoolPhysTracking`]: spt_core::PoolPhysTracking

use smallvec::SmallVec;
use spt_core::{Gfn, PhysExtIdx, PhysRef, PhysTracking, PoolBackend, PoolError, PoolIdx};

use crate::PagePool;

/// Number of references stored in one extent node.
pub(crate) const PHYS_EXT_REFS: usize = 3;

/// Maximum number of extent nodes in one chain.
const MAX_CHAIN_NODES: usize = 15;

const EMPTY_REF: PhysRef = PhysRef {
    page: PoolIdx::NIL,
    slot: 0,
};

#[derive(Debug, Clone, Copy)]
pub(crate) struct PhysExtent {
    pub refs: [PhysRef; PHYS_EXT_REFS],
    pub next: PhysExtIdx,
}

impl PhysExtent {
    fn empty(next: PhysExtIdx) -> Self {
        Self {
            refs: [EMPTY_REF; PHYS_EXT_REFS],
            next,
        }
    }

    fn is_empty(&self) -> bool {
        self.refs.iter().all(|r| r.page.is_nil())
    }
}

/// Result of recording a new leaf mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasOutcome {
    /// The mapping is tracked individually.
    Tracked,

    /// The guest page has too many mappings to track; the page holding the
    /// mapping must not be reused from the cache.
    Overflowed,
}

impl<Driver> PagePool<Driver>
where
    Driver: PoolBackend,
{
    /// Recreates the extent arena with every node free.
    pub(crate) fn rebuild_phys_ext_free_list(&mut self) {
        let max = self.config.max_phys_exts;

        self.phys_exts = (0..max)
            .map(|raw| {
                PhysExtent::empty(if raw + 1 < max {
                    PhysExtIdx::new(raw + 1)
                }
                else {
                    PhysExtIdx::NIL
                })
            })
            .collect();

        self.phys_ext_free_head = if max > 0 {
            PhysExtIdx::new(0)
        }
        else {
            PhysExtIdx::NIL
        };
    }

    fn phys_ext_alloc(&mut self, next: PhysExtIdx) -> Option<PhysExtIdx> {
        let idx = self.phys_ext_free_head;
        if idx.is_nil() {
            return None;
        }

        self.phys_ext_free_head = self.phys_exts[idx.as_usize()].next;
        self.phys_exts[idx.as_usize()] = PhysExtent::empty(next);
        Some(idx)
    }

    fn phys_ext_free(&mut self, idx: PhysExtIdx) {
        self.phys_exts[idx.as_usize()] = PhysExtent::empty(self.phys_ext_free_head);
        self.phys_ext_free_head = idx;
    }

    fn phys_ext_free_chain(&mut self, mut idx: PhysExtIdx) {
        while !idx.is_nil() {
            let next = self.phys_exts[idx.as_usize()].next;
            self.phys_ext_free(idx);
            idx = next;
        }
    }

    /// Records that entry `slot` of pool page `page` maps `gfn`.
    pub(crate) fn add_ref(
        &mut self,
        gfn: Gfn,
        page: PoolIdx,
        slot: u16,
    ) -> Result<AliasOutcome, PoolError> {
        let mut tracking = self.driver.phys_tracking(gfn)?;
        let new_ref = PhysRef::new(page, slot);

        if tracking.overflowed {
            return Ok(AliasOutcome::Overflowed);
        }

        if tracking.inline.is_none() {
            tracking.inline = Some(new_ref);
            self.driver.set_phys_tracking(gfn, tracking)?;
            return Ok(AliasOutcome::Tracked);
        }

        //
        // Look for a free tuple in the chain.
        //
        let mut nodes = 0;
        let mut current = tracking.extents;
        while !current.is_nil() {
            nodes += 1;

            let node = &mut self.phys_exts[current.as_usize()];
            if let Some(free) = node.refs.iter_mut().find(|r| r.page.is_nil()) {
                *free = new_ref;
                return Ok(AliasOutcome::Tracked);
            }

            if nodes >= MAX_CHAIN_NODES {
                break;
            }

            current = node.next;
        }

        let node = if nodes < MAX_CHAIN_NODES {
            self.phys_ext_alloc(tracking.extents)
        }
        else {
            None
        };

        match node {
            Some(node) => {
                self.phys_exts[node.as_usize()].refs[0] = new_ref;
                tracking.extents = node;
                self.driver.set_phys_tracking(gfn, tracking)?;

                tracing::trace!(%gfn, %node, nodes = nodes + 1, "extent node allocated");
                Ok(AliasOutcome::Tracked)
            }
            None => {
                self.stats.phys_ext_alloc_failures += 1;
                tracing::warn!(%gfn, nodes, "alias tracking overflowed");

                self.phys_ext_free_chain(tracking.extents);
                tracking = PhysTracking {
                    inline: None,
                    extents: PhysExtIdx::NIL,
                    overflowed: true,
                };
                self.driver.set_phys_tracking(gfn, tracking)?;

                Ok(AliasOutcome::Overflowed)
            }
        }
    }

    /// Removes the record that entry `slot` of pool page `page` maps `gfn`.
    pub(crate) fn remove_ref(
        &mut self,
        gfn: Gfn,
        page: PoolIdx,
        slot: u16,
    ) -> Result<(), PoolError> {
        let mut tracking = self.driver.phys_tracking(gfn)?;
        let old_ref = PhysRef::new(page, slot);

        if tracking.overflowed {
            return Ok(());
        }

        if tracking.inline == Some(old_ref) {
            tracking.inline = None;
            return self.driver.set_phys_tracking(gfn, tracking);
        }

        let mut prev = PhysExtIdx::NIL;
        let mut current = tracking.extents;
        while !current.is_nil() {
            let node = &mut self.phys_exts[current.as_usize()];
            let next = node.next;

            if let Some(found) = node.refs.iter_mut().find(|r| **r == old_ref) {
                *found = EMPTY_REF;

                if node.is_empty() {
                    if prev.is_nil() {
                        tracking.extents = next;
                        self.driver.set_phys_tracking(gfn, tracking)?;
                    }
                    else {
                        self.phys_exts[prev.as_usize()].next = next;
                    }

                    self.phys_ext_free(current);
                }

                return Ok(());
            }

            prev = current;
            current = next;
        }

        Err(PoolError::InvariantViolation("alias reference not tracked"))
    }

    /// Clears every shadow entry mapping `gfn`.
    ///
    /// Called when the guest page is remapped or its backing changes. Returns
    /// the number of entries cleared.
    pub fn flush_guest_phys(&mut self, gfn: Gfn) -> Result<usize, PoolError> {
        let tracking = self.driver.phys_tracking(gfn)?;

        let cleared = if tracking.overflowed {
            tracing::debug!(%gfn, "scanning all leaf pages for an overflowed alias field");
            self.flush_guest_phys_slow(gfn)?
        }
        else {
            let mut refs: SmallVec<[PhysRef; 8]> = SmallVec::new();
            refs.extend(tracking.inline);

            let mut current = tracking.extents;
            while !current.is_nil() {
                let node = &self.phys_exts[current.as_usize()];
                refs.extend(node.refs.iter().copied().filter(|r| !r.page.is_nil()));
                current = node.next;
            }

            self.phys_ext_free_chain(tracking.extents);

            for r in &refs {
                self.clear_entry_raw(r.page, r.slot as usize);
            }

            refs.len()
        };

        self.driver.set_phys_tracking(gfn, PhysTracking::default())?;

        if cleared > 0 {
            self.driver.invalidate_all_tlbs();
        }

        tracing::debug!(%gfn, cleared, "guest page unmapped from shadows");
        Ok(cleared)
    }

    fn flush_guest_phys_slow(&mut self, gfn: Gfn) -> Result<usize, PoolError> {
        let host = self.driver.host_frame(gfn)?;
        let mut cleared = 0;

        for raw in 1..self.pages.len() {
            let page = &self.pages[raw];
            if !page.is_used() || !page.format.is_leaf() || page.present_count == 0 {
                continue;
            }

            let first = page.first_present as usize;
            let slots: SmallVec<[usize; 8]> = (first..page.format.entry_count())
                .filter(|&slot| {
                    let entry = page.entry(slot);
                    page.format.entry_present(entry) && page.format.entry_target(entry) == host
                })
                .collect();

            for slot in slots {
                self.clear_entry_raw(PoolIdx::new(raw as u16), slot);
                cleared += 1;
            }
        }

        Ok(cleared)
    }

    /// Returns the number of free extent nodes.
    pub fn free_phys_exts(&self) -> usize {
        let mut count = 0;
        let mut current = self.phys_ext_free_head;
        while !current.is_nil() {
            count += 1;
            current = self.phys_exts[current.as_usize()].next;
        }

        count
    }

    /// Returns the number of extent nodes in the chain of `gfn`.
    pub fn phys_ext_chain_len(&self, gfn: Gfn) -> Result<usize, PoolError> {
        let tracking = self.driver.phys_tracking(gfn)?;

        let mut count = 0;
        let mut current = tracking.extents;
        while !current.is_nil() {
            count += 1;
            current = self.phys_exts[current.as_usize()].next;
        }

        Ok(count)
    }
}
