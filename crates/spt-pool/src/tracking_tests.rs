use spt_arch_x86::{PoolAccess, PoolFormat};
use spt_core::{AllocFlags, Gfn, Gpa, PhysRef, PoolConfig, PoolError, PoolIdx};

use super::{
    AliasOutcome, PagePool,
    mock::{GUEST_RAM_PAGES, MockDriver},
};

///////////////////////////////////////////////////////////////////////////////
// Test Helpers
///////////////////////////////////////////////////////////////////////////////

const LEAF: PoolFormat = PoolFormat::PaePtForPhys;
const TARGET: Gfn = Gfn(0x42);

fn pool_with(config: PoolConfig) -> Result<PagePool<MockDriver>, PoolError> {
    PagePool::new(MockDriver::new(), config)
}

fn alloc_leaves(pool: &mut PagePool<MockDriver>, count: u64) -> Result<Vec<PoolIdx>, PoolError> {
    (0..count)
        .map(|i| {
            pool.alloc(
                Gpa((i + 1) << 21),
                LEAF,
                PoolAccess::DontCare,
                None,
                AllocFlags::CACHEABLE,
            )
            .map(|alloc| alloc.index())
        })
        .collect()
}

///////////////////////////////////////////////////////////////////////////////
// Alias Tracking
///////////////////////////////////////////////////////////////////////////////

#[test]
fn fifth_alias_allocates_second_extent() -> Result<(), PoolError> {
    let mut pool = pool_with(PoolConfig::with_max_pages(16))?;
    let max_exts = pool.config().max_phys_exts as usize;
    let pages = alloc_leaves(&mut pool, 5)?;

    assert_eq!(pool.map_leaf(pages[0], 0, TARGET, true)?, AliasOutcome::Tracked);
    assert_eq!(
        pool.driver().tracking(TARGET).inline,
        Some(PhysRef::new(pages[0], 0))
    );
    assert_eq!(pool.phys_ext_chain_len(TARGET)?, 0);

    for &page in &pages[1..4] {
        assert_eq!(pool.map_leaf(page, 0, TARGET, true)?, AliasOutcome::Tracked);
    }

    assert_eq!(pool.phys_ext_chain_len(TARGET)?, 1);
    assert_eq!(pool.free_phys_exts(), max_exts - 1);

    assert_eq!(pool.map_leaf(pages[4], 0, TARGET, true)?, AliasOutcome::Tracked);
    assert_eq!(pool.phys_ext_chain_len(TARGET)?, 2);
    assert_eq!(pool.free_phys_exts(), max_exts - 2);

    Ok(())
}

#[test]
fn extents_return_to_free_list() -> Result<(), PoolError> {
    let mut pool = pool_with(PoolConfig::with_max_pages(16))?;
    let max_exts = pool.config().max_phys_exts as usize;
    let pages = alloc_leaves(&mut pool, 5)?;

    for &page in &pages {
        pool.map_leaf(page, 9, TARGET, false)?;
    }

    assert_eq!(pool.free_phys_exts(), max_exts - 2);

    // Emptying the newest node releases it.
    pool.unmap_leaf(pages[4], 9)?;
    assert_eq!(pool.phys_ext_chain_len(TARGET)?, 1);
    assert_eq!(pool.free_phys_exts(), max_exts - 1);

    for &page in &pages[..4] {
        pool.unmap_leaf(page, 9)?;
        assert!(!pool.page(page).expect("page").entry_present(9));
    }

    assert_eq!(pool.free_phys_exts(), max_exts);
    assert!(pool.driver().tracking(TARGET).is_empty());

    Ok(())
}

#[test]
fn flushing_pages_drops_aliases() -> Result<(), PoolError> {
    let mut pool = pool_with(PoolConfig::with_max_pages(16).with_cache(false))?;
    let max_exts = pool.config().max_phys_exts as usize;
    let pages = alloc_leaves(&mut pool, 5)?;

    for &page in &pages {
        pool.map_leaf(page, 0, TARGET, true)?;
        pool.map_leaf(page, 1, Gfn(0x43), true)?;
    }

    for &page in &pages {
        pool.free(page, None)?;
    }

    assert_eq!(pool.free_phys_exts(), max_exts);
    assert!(pool.driver().tracking(TARGET).is_empty());
    assert!(pool.driver().tracking(Gfn(0x43)).is_empty());

    Ok(())
}

#[test]
fn remapping_entry_moves_alias() -> Result<(), PoolError> {
    let mut pool = pool_with(PoolConfig::with_max_pages(16))?;
    let pages = alloc_leaves(&mut pool, 1)?;

    pool.map_leaf(pages[0], 3, TARGET, true)?;
    pool.map_leaf(pages[0], 3, Gfn(0x43), true)?;

    assert!(pool.driver().tracking(TARGET).is_empty());
    assert_eq!(
        pool.driver().tracking(Gfn(0x43)).inline,
        Some(PhysRef::new(pages[0], 3))
    );

    let page = pool.page(pages[0]).expect("page");
    assert_eq!(page.present_count(), 1);
    assert_eq!(page.first_present(), Some(3));

    Ok(())
}

#[test]
fn present_bookkeeping_tracks_lowest_entry() -> Result<(), PoolError> {
    let mut pool = pool_with(PoolConfig::with_max_pages(16))?;
    let pages = alloc_leaves(&mut pool, 1)?;
    let idx = pages[0];

    pool.map_leaf(idx, 10, Gfn(1), true)?;
    pool.map_leaf(idx, 4, Gfn(2), true)?;
    pool.map_leaf(idx, 20, Gfn(3), true)?;
    assert_eq!(pool.page(idx).expect("page").first_present(), Some(4));

    pool.unmap_leaf(idx, 4)?;
    assert_eq!(pool.page(idx).expect("page").first_present(), Some(10));

    pool.unmap_leaf(idx, 10)?;
    pool.unmap_leaf(idx, 20)?;

    let page = pool.page(idx).expect("page");
    assert_eq!(page.present_count(), 0);
    assert_eq!(page.first_present(), None);

    Ok(())
}

#[test]
fn mapping_rejects_bad_requests() -> Result<(), PoolError> {
    let mut pool = pool_with(PoolConfig::with_max_pages(16))?;
    let pages = alloc_leaves(&mut pool, 1)?;

    assert!(matches!(
        pool.map_leaf(pages[0], 0, Gfn(GUEST_RAM_PAGES), true),
        Err(PoolError::NotRam(_))
    ));
    assert!(matches!(
        pool.map_leaf(pages[0], 512, TARGET, true),
        Err(PoolError::InvariantViolation(_))
    ));

    let directory = pool
        .alloc(
            Gpa(0),
            PoolFormat::PaePdPhys,
            PoolAccess::DontCare,
            None,
            AllocFlags::empty(),
        )?
        .index();
    assert!(matches!(
        pool.map_leaf(directory, 0, TARGET, true),
        Err(PoolError::InvariantViolation(_))
    ));

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Overflow
///////////////////////////////////////////////////////////////////////////////

#[test]
fn exhausted_extents_overflow() -> Result<(), PoolError> {
    let mut pool = pool_with(PoolConfig::with_max_pages(16).with_max_phys_exts(1))?;
    let pages = alloc_leaves(&mut pool, 5)?;

    for &page in &pages[..4] {
        assert_eq!(pool.map_leaf(page, 0, TARGET, true)?, AliasOutcome::Tracked);
    }
    assert_eq!(pool.free_phys_exts(), 0);

    assert_eq!(
        pool.map_leaf(pages[4], 0, TARGET, true)?,
        AliasOutcome::Overflowed
    );

    let tracking = pool.driver().tracking(TARGET);
    assert!(tracking.overflowed);
    assert!(tracking.inline.is_none());
    assert!(tracking.extents.is_nil());
    assert_eq!(pool.free_phys_exts(), 1);
    assert_eq!(pool.stats().phys_ext_alloc_failures, 1);

    // The overflowing page is no longer reusable from the cache.
    assert!(!pool.page(pages[4]).expect("page").is_cached());
    pool.free(pages[4], None)?;
    assert!(pool.page(pages[4]).is_none());

    // Removals from an overflowed field are ignored.
    pool.unmap_leaf(pages[0], 0)?;
    assert!(pool.driver().tracking(TARGET).overflowed);

    Ok(())
}

#[test]
fn chain_length_is_capped() -> Result<(), PoolError> {
    let mut pool = pool_with(PoolConfig::with_max_pages(16))?;
    let pages = alloc_leaves(&mut pool, 1)?;

    // One inline reference plus fifteen nodes of three.
    for slot in 0..46 {
        assert_eq!(
            pool.map_leaf(pages[0], slot, TARGET, true)?,
            AliasOutcome::Tracked
        );
    }
    assert_eq!(pool.phys_ext_chain_len(TARGET)?, 15);

    assert_eq!(
        pool.map_leaf(pages[0], 46, TARGET, true)?,
        AliasOutcome::Overflowed
    );
    assert_eq!(pool.phys_ext_chain_len(TARGET)?, 0);
    assert_eq!(
        pool.free_phys_exts(),
        pool.config().max_phys_exts as usize
    );

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Guest Page Flush
///////////////////////////////////////////////////////////////////////////////

#[test]
fn flush_guest_phys_clears_every_alias() -> Result<(), PoolError> {
    let mut pool = pool_with(PoolConfig::with_max_pages(16))?;
    let max_exts = pool.config().max_phys_exts as usize;
    let pages = alloc_leaves(&mut pool, 5)?;

    for &page in &pages {
        pool.map_leaf(page, 2, TARGET, true)?;
    }
    pool.map_leaf(pages[0], 3, Gfn(0x43), true)?;

    let tlb_flushes = pool.driver().tlb_flushes();
    assert_eq!(pool.flush_guest_phys(TARGET)?, 5);
    assert_eq!(pool.driver().tlb_flushes(), tlb_flushes + 1);

    for &page in &pages {
        assert!(!pool.page(page).expect("page").entry_present(2));
    }
    assert!(pool.page(pages[0]).expect("page").entry_present(3));

    assert!(pool.driver().tracking(TARGET).is_empty());
    assert_eq!(pool.free_phys_exts(), max_exts);

    // Nothing left to clear.
    assert_eq!(pool.flush_guest_phys(TARGET)?, 0);
    assert_eq!(pool.driver().tlb_flushes(), tlb_flushes + 1);

    Ok(())
}

#[test]
fn flush_guest_phys_scans_overflowed_field() -> Result<(), PoolError> {
    let mut pool = pool_with(PoolConfig::with_max_pages(16).with_max_phys_exts(1))?;
    let pages = alloc_leaves(&mut pool, 6)?;

    for &page in &pages {
        pool.map_leaf(page, 7, TARGET, true)?;
    }
    assert!(pool.driver().tracking(TARGET).overflowed);

    assert_eq!(pool.flush_guest_phys(TARGET)?, 6);
    for &page in &pages {
        let page = pool.page(page).expect("page");
        assert!(!page.entry_present(7));
        assert_eq!(page.present_count(), 0);
    }

    assert!(pool.driver().tracking(TARGET).is_empty());

    Ok(())
}
