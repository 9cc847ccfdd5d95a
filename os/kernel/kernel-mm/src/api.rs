//! The boundary the rest of the kernel programs against.
//!
//! Every function here takes and releases the relevant locks (with interrupts
//! masked) and reports failure in-band: a zero physical address from
//! [`allocate_pages`], a null pointer from [`allocate_object`],
//! [`MAP_FAILED`] or `-1` from the mapping calls. Corruption is never
//! reported this way; the lower layers halt on it.

use core::ptr::NonNull;

use kernel_addresses::{PhysAddr, TaskId, VirtAddr};
use kernel_pmm::{PageOwner, ZoneId, ZoneStats};
use kernel_vmem::{
    Access, AddressSpace, FaultVerdict, FrameAlloc, MapFlags, PageTables, Protection, RegionKind,
};

use crate::{caches, zones};

/// Sentinel returned by [`mmap`] when the request cannot be satisfied.
pub const MAP_FAILED: u64 = u64::MAX;

/// Allocates `2^order` contiguous pages from `zone`, or zero on failure.
#[must_use]
pub fn allocate_pages(zone: ZoneId, order: u8) -> PhysAddr {
    zones().with_irq_lock(|zones| match zones.allocate(zone, order) {
        Ok(pa) => pa,
        Err(err) => {
            log::warn!("page allocation failed: {err}");
            PhysAddr::zero()
        }
    })
}

/// Returns a block obtained from [`allocate_pages`].
///
/// An address the zones do not recognize is rejected and logged rather than
/// folded into a bitmap.
pub fn free_pages(pa: PhysAddr, order: u8) {
    zones().with_irq_lock(|zones| {
        if let Err(err) = zones.free(pa, order) {
            log::warn!("page free rejected: {err}");
        }
    });
}

/// Point-in-time counters for `zone`.
#[must_use]
pub fn zone_stats(zone: ZoneId) -> ZoneStats {
    zones().with_irq_lock(|zones| zones.zone(zone).stats())
}

/// Allocates an object of at least `size` bytes, or null on failure.
#[must_use]
pub fn allocate_object(size: usize) -> *mut u8 {
    caches().with_irq_lock(|caches| {
        zones().with_irq_lock(|zones| match caches.allocate(zones, size) {
            Ok(object) => object.as_ptr(),
            Err(err) => {
                log::warn!("object allocation of {size} bytes failed: {err}");
                core::ptr::null_mut()
            }
        })
    })
}

/// Returns an object obtained from [`allocate_object`]. Null is a no-op.
pub fn free_object(object: *mut u8) {
    let Some(object) = NonNull::new(object) else {
        return;
    };
    caches().with_irq_lock(|caches| {
        zones().with_irq_lock(|zones| caches.free(zones, object));
    });
}

/// Hands every fully-free cache group back to the buddy allocator and
/// returns the number of pages reclaimed.
#[must_use = "the count tells memory-pressure handling whether shrinking helped"]
pub fn shrink_caches() -> u64 {
    caches().with_irq_lock(|caches| zones().with_irq_lock(|zones| caches.shrink(zones)))
}

/// Maps `len` bytes into `space` and returns the start address, or
/// [`MAP_FAILED`].
pub fn mmap(
    space: &mut AddressSpace,
    addr: VirtAddr,
    len: u64,
    prot: Protection,
    kind: RegionKind,
    flags: MapFlags,
) -> u64 {
    match space.mmap(addr, len, prot, kind, flags) {
        Ok(start) => start.as_u64(),
        Err(err) => {
            log::warn!("{}: mmap failed: {err}", space.task());
            MAP_FAILED
        }
    }
}

/// Unmaps `[addr, addr + len)` from `space`. Returns `0`, or `-1` on error.
pub fn munmap(
    space: &mut AddressSpace,
    pt: &mut impl PageTables,
    addr: VirtAddr,
    len: u64,
) -> i64 {
    let mut frames = ZoneFrames::for_task(space.task());
    match space.munmap(pt, &mut frames, addr, len) {
        Ok(()) => 0,
        Err(err) => {
            log::warn!("{}: munmap failed: {err}", space.task());
            -1
        }
    }
}

/// Moves the program break of `space` and returns the break now in effect.
pub fn set_break(space: &mut AddressSpace, pt: &mut impl PageTables, new_break: VirtAddr) -> u64 {
    let mut frames = ZoneFrames::for_task(space.task());
    space.set_break(pt, &mut frames, new_break).as_u64()
}

/// Page-fault entry point. Binds a fresh frame for a legitimate access and
/// tells the trap handler whether to retry or to deliver a fatal fault.
pub fn handle_page_fault(
    space: &mut AddressSpace,
    pt: &mut impl PageTables,
    va: VirtAddr,
    access: Access,
) -> FaultVerdict {
    let mut frames = ZoneFrames::for_task(space.task());
    space.handle_fault(pt, &mut frames, va, access)
}

/// Tears down `space` at task exit, returning every bound frame.
pub fn release_address_space(space: &mut AddressSpace, pt: &mut impl PageTables) {
    let mut frames = ZoneFrames::for_task(space.task());
    space.release_all(pt, &mut frames);
}

/// Frame source for demand paging: order-0 pages from the dynamic zone,
/// tagged with the owning task.
///
/// Address-space surgery runs with interrupts enabled; only the individual
/// page operations below take the zone lock, keeping the masked sections
/// short.
struct ZoneFrames {
    task: TaskId,
}

impl ZoneFrames {
    fn for_task(task: TaskId) -> Self {
        Self { task }
    }
}

impl FrameAlloc for ZoneFrames {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        let task = self.task;
        zones().with_irq_lock(|zones| {
            let pa = match zones.allocate(ZoneId::Dynamic, 0) {
                Ok(pa) => pa,
                Err(err) => {
                    log::warn!("{task}: frame allocation failed: {err}");
                    return None;
                }
            };
            match zones.tag_pages(pa, 1, PageOwner::Mapped { task }) {
                Ok(()) => Some(pa),
                Err(err) => {
                    // The page came out of a zone, so it cannot be unknown
                    // there.
                    log::error!("{task}: tagging fresh frame {pa:?} failed: {err}");
                    let _ = zones.free(pa, 0);
                    None
                }
            }
        })
    }

    fn free_frame(&mut self, pa: PhysAddr) {
        let task = self.task;
        zones().with_irq_lock(|zones| {
            if let Err(err) = zones.free(pa, 0) {
                log::warn!("{task}: frame free rejected: {err}");
            }
        });
    }
}
