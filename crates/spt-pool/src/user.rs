//! User records.
//!
//! A user record states that entry `slot` of pool page `owner` points at the
//! page the record is attached to. Records are kept in a fixed arena with an
//! intrusive free list.

use spt_core::{PoolBackend, PoolError, PoolIdx, Resource, UserIdx};

use crate::PagePool;

/// A shadow entry pointing at a pool page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolUser {
    /// The pool page holding the entry.
    pub owner: PoolIdx,

    /// The entry index within the owner.
    pub slot: u16,
}

impl PoolUser {
    /// Creates a new user.
    pub fn new(owner: PoolIdx, slot: u16) -> Self {
        Self { owner, slot }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct UserRecord {
    pub owner: PoolIdx,
    pub slot: u16,
    pub next: UserIdx,
}

/// Creates an arena of `max` free user records chained in index order.
pub(crate) fn new_user_arena(max: u16) -> Vec<UserRecord> {
    (0..max)
        .map(|raw| UserRecord {
            owner: PoolIdx::NIL,
            slot: 0,
            next: if raw + 1 < max {
                UserIdx::new(raw + 1)
            }
            else {
                UserIdx::NIL
            },
        })
        .collect()
}

impl<Driver> PagePool<Driver>
where
    Driver: PoolBackend,
{
    /// Records that `user` points at page `idx`.
    ///
    /// Page `idx` must be protected from eviction by the caller, since
    /// running out of records evicts pages.
    pub(crate) fn add_user_record(
        &mut self,
        idx: PoolIdx,
        user: PoolUser,
    ) -> Result<(), PoolError> {
        if self.user_free_head.is_nil() {
            self.free_one_user(user.owner)?;
        }

        let record_idx = self.user_free_head;
        let head = self.pages[idx.as_usize()].user_head;

        let record = &mut self.users[record_idx.as_usize()];
        self.user_free_head = record.next;
        record.owner = user.owner;
        record.slot = user.slot;
        record.next = head;

        self.pages[idx.as_usize()].user_head = record_idx;
        self.cache_used(idx);

        Ok(())
    }

    /// Removes the record stating that `user` points at page `idx`.
    ///
    /// Returns `false` if there was no such record.
    pub(crate) fn free_user_record(&mut self, idx: PoolIdx, user: PoolUser) -> bool {
        let mut prev = UserIdx::NIL;
        let mut current = self.pages[idx.as_usize()].user_head;

        while !current.is_nil() {
            let record = self.users[current.as_usize()];
            if record.owner == user.owner && record.slot == user.slot {
                if prev.is_nil() {
                    self.pages[idx.as_usize()].user_head = record.next;
                }
                else {
                    self.users[prev.as_usize()].next = record.next;
                }

                let record = &mut self.users[current.as_usize()];
                record.owner = PoolIdx::NIL;
                record.slot = 0;
                record.next = self.user_free_head;
                self.user_free_head = current;
                return true;
            }

            prev = current;
            current = record.next;
        }

        false
    }

    /// Evicts pages until a user record is free.
    fn free_one_user(&mut self, protect: PoolIdx) -> Result<(), PoolError> {
        self.stats.free_one_user += 1;

        if !self.config.cache_enabled {
            return Err(PoolError::ResourceExhausted(Resource::Users));
        }

        while self.user_free_head.is_nil() {
            self.cache_free_one(protect).map_err(|err| match err {
                PoolError::ResourceExhausted(_) => PoolError::ResourceExhausted(Resource::Users),
                err => err,
            })?;
        }

        Ok(())
    }

    /// Clears every shadow entry pointing at page `idx` and frees the
    /// records.
    pub(crate) fn clear_page_users(&mut self, idx: PoolIdx) {
        let mut current =
            std::mem::replace(&mut self.pages[idx.as_usize()].user_head, UserIdx::NIL);

        while !current.is_nil() {
            let record = self.users[current.as_usize()];

            let expected = self.pages[idx.as_usize()].host_frame;
            let owner = &self.pages[record.owner.as_usize()];
            let raw = owner.entry(record.slot as usize);
            if owner.format.entry_present(raw) && owner.format.entry_target(raw) == expected {
                self.clear_entry_raw(record.owner, record.slot as usize);
            }
            else {
                tracing::warn!(
                    %idx,
                    owner = %record.owner,
                    slot = record.slot,
                    "user entry does not point at the page"
                );
            }

            let next = record.next;
            let record = &mut self.users[current.as_usize()];
            record.owner = PoolIdx::NIL;
            record.slot = 0;
            record.next = self.user_free_head;
            self.user_free_head = current;

            current = next;
        }
    }

    /// Points entry `user.slot` of `user.owner` at page `idx`.
    ///
    /// This only records the reference; the entry itself is written by
    /// [`link_child`].
    ///
    /// [`link_child`]: Self::link_child
    pub fn add_user(&mut self, idx: PoolIdx, user: PoolUser) -> Result<(), PoolError> {
        self.used_page(idx)?;
        self.used_page(user.owner)?;

        self.pages[idx.as_usize()].lock_count += 1;
        let result = self.add_user_record(idx, user);
        self.pages[idx.as_usize()].lock_count -= 1;
        result
    }

    /// Removes the reference from entry `user.slot` of `user.owner` to page
    /// `idx`.
    pub fn free_user(&mut self, idx: PoolIdx, user: PoolUser) -> Result<(), PoolError> {
        self.used_page(idx)?;

        if !self.free_user_record(idx, user) {
            return Err(PoolError::InvariantViolation("unknown user"));
        }

        Ok(())
    }

    /// Returns the shadow entries pointing at page `idx`.
    pub fn users(&self, idx: PoolIdx) -> impl Iterator<Item = PoolUser> + '_ {
        let mut current = self
            .pages
            .get(idx.as_usize())
            .map_or(UserIdx::NIL, |page| page.user_head);

        std::iter::from_fn(move || {
            if current.is_nil() {
                return None;
            }

            let record = self.users[current.as_usize()];
            current = record.next;
            Some(PoolUser::new(record.owner, record.slot))
        })
    }

    /// Returns the number of free user records.
    pub fn free_user_records(&self) -> usize {
        let mut count = 0;
        let mut current = self.user_free_head;
        while !current.is_nil() {
            count += 1;
            current = self.users[current.as_usize()].next;
        }

        count
    }
}
