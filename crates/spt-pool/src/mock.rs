use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
};

use spt_core::{
    Gfn, Gpa, HostFrame, PAGE_SIZE, PhysTracking, PoolAccessHandler, PoolDriver, PoolError,
    PoolGrow, PoolGuestRead, PoolIdx, PoolInfo, PoolPhysTracking, PoolTlb,
};

/// First host frame handed out by the mock backing allocator.
pub const POOL_FRAME_BASE: u64 = 0x10000;

/// Guest frame `n` is backed by host frame `GUEST_FRAME_BASE + n`.
pub const GUEST_FRAME_BASE: u64 = 0x80000;

/// Number of guest RAM pages.
pub const GUEST_RAM_PAGES: u64 = 0x10000;

///////////////////////////////////////////////////////////////////////////////
// Mock Driver
///////////////////////////////////////////////////////////////////////////////

pub struct MockDriver {
    tracking: RefCell<HashMap<Gfn, PhysTracking>>,
    guest: RefCell<HashMap<Gfn, Vec<u8>>>,
    handlers: RefCell<HashMap<Gfn, PoolIdx>>,
    temp_off: RefCell<HashSet<Gfn>>,
    handler_resets: Cell<usize>,
    tlb_flushes: Cell<usize>,
    next_frame: Cell<u64>,
    handed_out: Cell<u64>,
    grow_calls: Cell<usize>,
    grow_limit: Cell<Option<u16>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            tracking: RefCell::new(HashMap::new()),
            guest: RefCell::new(HashMap::new()),
            handlers: RefCell::new(HashMap::new()),
            temp_off: RefCell::new(HashSet::new()),
            handler_resets: Cell::new(0),
            tlb_flushes: Cell::new(0),
            next_frame: Cell::new(POOL_FRAME_BASE),
            handed_out: Cell::new(0),
            grow_calls: Cell::new(0),
            grow_limit: Cell::new(None),
        }
    }

    /// Caps the total number of frames the backing allocator hands out.
    pub fn limit_backing(&self, pages: u16) {
        self.grow_limit.set(Some(pages));
    }

    /// Hands out the following backing frames starting at `frame`.
    pub fn place_backing_at(&self, frame: u64) {
        self.next_frame.set(frame);
    }

    /// Writes bytes into guest memory.
    pub fn write_guest(&self, gpa: Gpa, bytes: &[u8]) {
        let mut guest = self.guest.borrow_mut();
        let page = guest
            .entry(gpa.gfn())
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize]);

        let offset = gpa.page_offset() as usize;
        page[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn tracking(&self, gfn: Gfn) -> PhysTracking {
        self.tracking
            .borrow()
            .get(&gfn)
            .copied()
            .unwrap_or_default()
    }

    pub fn handler_owner(&self, gfn: Gfn) -> Option<PoolIdx> {
        self.handlers.borrow().get(&gfn).copied()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    pub fn is_temp_off(&self, gfn: Gfn) -> bool {
        self.temp_off.borrow().contains(&gfn)
    }

    pub fn handler_resets(&self) -> usize {
        self.handler_resets.get()
    }

    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes.get()
    }

    pub fn grow_calls(&self) -> usize {
        self.grow_calls.get()
    }
}

pub fn guest_host_frame(gfn: Gfn) -> HostFrame {
    HostFrame(GUEST_FRAME_BASE + gfn.0)
}

impl PoolDriver for MockDriver {
    fn info(&self) -> Result<PoolInfo, PoolError> {
        Ok(PoolInfo {
            ram_size: GUEST_RAM_PAGES * PAGE_SIZE,
            vcpus: 1,
        })
    }
}

impl PoolGrow for MockDriver {
    fn grow(&self, count: u16) -> Result<Vec<HostFrame>, PoolError> {
        self.grow_calls.set(self.grow_calls.get() + 1);

        let handed_out = self.handed_out.get();
        let count = match self.grow_limit.get() {
            Some(limit) => (u64::from(limit).saturating_sub(handed_out)).min(u64::from(count)),
            None => u64::from(count),
        };

        if count == 0 {
            return Err(PoolError::NotSupported);
        }

        let first = self.next_frame.get();
        self.next_frame.set(first + count);
        self.handed_out.set(handed_out + count);
        Ok((first..first + count).map(HostFrame).collect())
    }
}

impl PoolPhysTracking for MockDriver {
    fn phys_tracking(&self, gfn: Gfn) -> Result<PhysTracking, PoolError> {
        if gfn.0 >= GUEST_RAM_PAGES {
            return Err(PoolError::NotRam(gfn));
        }

        Ok(self.tracking(gfn))
    }

    fn set_phys_tracking(&self, gfn: Gfn, tracking: PhysTracking) -> Result<(), PoolError> {
        if gfn.0 >= GUEST_RAM_PAGES {
            return Err(PoolError::NotRam(gfn));
        }

        let mut map = self.tracking.borrow_mut();
        if tracking.is_empty() {
            map.remove(&gfn);
        }
        else {
            map.insert(gfn, tracking);
        }

        Ok(())
    }

    fn clear_all_phys_tracking(&self) -> Result<(), PoolError> {
        self.tracking.borrow_mut().clear();
        Ok(())
    }

    fn host_frame(&self, gfn: Gfn) -> Result<HostFrame, PoolError> {
        if gfn.0 >= GUEST_RAM_PAGES {
            return Err(PoolError::NotRam(gfn));
        }

        Ok(guest_host_frame(gfn))
    }

    fn guest_frame(&self, host: HostFrame) -> Option<Gfn> {
        let gfn = host.0.checked_sub(GUEST_FRAME_BASE)?;
        (gfn < GUEST_RAM_PAGES).then_some(Gfn(gfn))
    }
}

impl PoolAccessHandler for MockDriver {
    fn register_write_handler(&self, gfn: Gfn, owner: PoolIdx) -> Result<(), PoolError> {
        let mut handlers = self.handlers.borrow_mut();
        if handlers.contains_key(&gfn) {
            return Err(PoolError::InvariantViolation("write handler registered twice"));
        }

        handlers.insert(gfn, owner);
        Ok(())
    }

    fn unregister_write_handler(&self, gfn: Gfn) -> Result<(), PoolError> {
        self.temp_off.borrow_mut().remove(&gfn);
        self.handlers
            .borrow_mut()
            .remove(&gfn)
            .map(|_| ())
            .ok_or(PoolError::InvariantViolation("write handler not registered"))
    }

    fn change_write_handler_owner(&self, gfn: Gfn, owner: PoolIdx) -> Result<(), PoolError> {
        let mut handlers = self.handlers.borrow_mut();
        let entry = handlers
            .get_mut(&gfn)
            .ok_or(PoolError::InvariantViolation("write handler not registered"))?;

        *entry = owner;
        Ok(())
    }

    fn reset_write_handler(&self, gfn: Gfn) -> Result<(), PoolError> {
        self.handler_resets.set(self.handler_resets.get() + 1);
        self.temp_off.borrow_mut().remove(&gfn);
        Ok(())
    }

    fn temp_off_write_handler(&self, gfn: Gfn) -> Result<(), PoolError> {
        if !self.handlers.borrow().contains_key(&gfn) {
            return Err(PoolError::InvariantViolation("write handler not registered"));
        }

        self.temp_off.borrow_mut().insert(gfn);
        Ok(())
    }
}

impl PoolGuestRead for MockDriver {
    fn read_guest_page(&self, gfn: Gfn) -> Result<Vec<u8>, PoolError> {
        Ok(self
            .guest
            .borrow()
            .get(&gfn)
            .cloned()
            .unwrap_or_else(|| vec![0u8; PAGE_SIZE as usize]))
    }
}

impl PoolTlb for MockDriver {
    fn invalidate_all_tlbs(&self) {
        self.tlb_flushes.set(self.tlb_flushes.get() + 1);
    }
}
