use std::{collections::HashMap, sync::Arc, thread};

use parking_lot::Mutex;
use spt_arch_x86::{PoolAccess, PoolFormat};
use spt_core::{
    AllocFlags, Gfn, Gpa, HostFrame, PhysTracking, PoolAccessHandler, PoolConfig, PoolDriver,
    PoolError, PoolGrow, PoolGuestRead, PoolIdx, PoolInfo, PoolPhysTracking, PoolTlb, Rendezvous,
};
use spt_pool::{PagePool, SharedPagePool};

const EXECUTORS: usize = 4;
const ROUNDS: usize = 8;

const GUEST_FRAME_BASE: u64 = 0x80000;

///////////////////////////////////////////////////////////////////////////////
// Test Driver
///////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct State {
    tracking: HashMap<Gfn, PhysTracking>,
    handlers: HashMap<Gfn, PoolIdx>,
    next_frame: u64,
    tlb_flushes: usize,
    fail_clear: bool,
}

#[derive(Default)]
struct SharedDriver {
    state: Mutex<State>,
}

impl PoolDriver for SharedDriver {
    fn info(&self) -> Result<PoolInfo, PoolError> {
        Ok(PoolInfo {
            ram_size: 256 * 1024 * 1024,
            vcpus: EXECUTORS as u16,
        })
    }
}

impl PoolGrow for SharedDriver {
    fn grow(&self, count: u16) -> Result<Vec<HostFrame>, PoolError> {
        let mut state = self.state.lock();
        let first = 0x10000 + state.next_frame;
        state.next_frame += u64::from(count);
        Ok((first..first + u64::from(count)).map(HostFrame).collect())
    }
}

impl PoolPhysTracking for SharedDriver {
    fn phys_tracking(&self, gfn: Gfn) -> Result<PhysTracking, PoolError> {
        Ok(self
            .state
            .lock()
            .tracking
            .get(&gfn)
            .copied()
            .unwrap_or_default())
    }

    fn set_phys_tracking(&self, gfn: Gfn, tracking: PhysTracking) -> Result<(), PoolError> {
        self.state.lock().tracking.insert(gfn, tracking);
        Ok(())
    }

    fn clear_all_phys_tracking(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if state.fail_clear {
            return Err(PoolError::NotSupported);
        }

        state.tracking.clear();
        Ok(())
    }

    fn host_frame(&self, gfn: Gfn) -> Result<HostFrame, PoolError> {
        Ok(HostFrame(GUEST_FRAME_BASE + gfn.0))
    }

    fn guest_frame(&self, host: HostFrame) -> Option<Gfn> {
        host.0.checked_sub(GUEST_FRAME_BASE).map(Gfn)
    }
}

impl PoolAccessHandler for SharedDriver {
    fn register_write_handler(&self, gfn: Gfn, owner: PoolIdx) -> Result<(), PoolError> {
        self.state.lock().handlers.insert(gfn, owner);
        Ok(())
    }

    fn unregister_write_handler(&self, gfn: Gfn) -> Result<(), PoolError> {
        self.state.lock().handlers.remove(&gfn);
        Ok(())
    }

    fn change_write_handler_owner(&self, gfn: Gfn, owner: PoolIdx) -> Result<(), PoolError> {
        self.state.lock().handlers.insert(gfn, owner);
        Ok(())
    }

    fn reset_write_handler(&self, _gfn: Gfn) -> Result<(), PoolError> {
        Ok(())
    }

    fn temp_off_write_handler(&self, _gfn: Gfn) -> Result<(), PoolError> {
        Ok(())
    }
}

impl PoolGuestRead for SharedDriver {
    fn read_guest_page(&self, _gfn: Gfn) -> Result<Vec<u8>, PoolError> {
        Ok(vec![0u8; 4096])
    }
}

impl PoolTlb for SharedDriver {
    fn invalidate_all_tlbs(&self) {
        self.state.lock().tlb_flushes += 1;
    }
}

///////////////////////////////////////////////////////////////////////////////
// Clear All
///////////////////////////////////////////////////////////////////////////////

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

fn shared_pool(driver: SharedDriver) -> Result<Arc<SharedPagePool<SharedDriver>>, PoolError> {
    let config = PoolConfig::from_ram_size(driver.info()?.ram_size);
    Ok(Arc::new(SharedPagePool::new(PagePool::new(driver, config)?)))
}

#[test]
fn clear_all_runs_once_per_round() -> Result<(), PoolError> {
    init_tracing();

    let pool = shared_pool(SharedDriver::default())?;
    let rendezvous = Arc::new(Rendezvous::new(EXECUTORS));

    let handles: Vec<_> = (0..EXECUTORS)
        .map(|executor| {
            let pool = Arc::clone(&pool);
            let rendezvous = Arc::clone(&rendezvous);

            thread::spawn(move || -> Result<usize, PoolError> {
                let mut performed = 0;

                for round in 0..ROUNDS {
                    {
                        let mut pool = pool.lock();
                        let gpa = Gpa((((executor * ROUNDS + round) as u64) + 1) << 21);
                        let idx = pool
                            .alloc(
                                gpa,
                                PoolFormat::PaePtForPhys,
                                PoolAccess::DontCare,
                                None,
                                AllocFlags::CACHEABLE,
                            )?
                            .index();

                        for slot in 0..4 {
                            pool.map_leaf(idx, slot, Gfn(u64::from(slot) + 0x100), true)?;
                        }
                    }

                    if pool.clear_all(&rendezvous)? {
                        performed += 1;
                    }
                }

                Ok(performed)
            })
        })
        .collect();

    let mut performed = 0;
    for handle in handles {
        performed += handle.join().expect("executor panicked")?;
    }

    assert_eq!(performed, ROUNDS);
    assert_eq!(rendezvous.rounds(), ROUNDS as u64);

    let pool = Arc::try_unwrap(pool)
        .unwrap_or_else(|_| panic!("pool still shared"))
        .into_inner();
    assert_eq!(pool.stats().clear_alls, ROUNDS as u64);
    assert_eq!(pool.used_pages() as usize, EXECUTORS * ROUNDS);
    assert!(pool.pages().all(|page| page.present_count() == 0));

    let driver = pool.teardown()?;
    assert!(driver.state.lock().tracking.is_empty());
    assert!(driver.state.lock().tlb_flushes >= ROUNDS);

    Ok(())
}

#[test]
fn failed_clear_all_reaches_every_executor() -> Result<(), PoolError> {
    init_tracing();

    let driver = SharedDriver::default();
    driver.state.lock().fail_clear = true;

    let pool = shared_pool(driver)?;
    let rendezvous = Arc::new(Rendezvous::new(EXECUTORS));

    let handles: Vec<_> = (0..EXECUTORS)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let rendezvous = Arc::clone(&rendezvous);
            thread::spawn(move || pool.clear_all(&rendezvous))
        })
        .collect();

    let mut leader_errors = 0;
    let mut peer_errors = 0;
    for handle in handles {
        match handle.join().expect("executor panicked") {
            Err(PoolError::NotSupported) => leader_errors += 1,
            Err(PoolError::ClearAllFailed) => peer_errors += 1,
            other => panic!("unexpected clear_all result: {other:?}"),
        }
    }

    assert_eq!(leader_errors, 1);
    assert_eq!(peer_errors, EXECUTORS - 1);

    //
    // The next round succeeds everywhere once the collaborator recovers.
    //
    pool.lock().driver().state.lock().fail_clear = false;

    let handles: Vec<_> = (0..EXECUTORS)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let rendezvous = Arc::clone(&rendezvous);
            thread::spawn(move || pool.clear_all(&rendezvous))
        })
        .collect();

    let mut performed = 0;
    for handle in handles {
        if handle.join().expect("executor panicked")? {
            performed += 1;
        }
    }

    assert_eq!(performed, 1);
    assert_eq!(rendezvous.rounds(), 2);

    Ok(())
}
