//! Kernel memory core wiring.
//!
//! This crate owns the kernel-wide singletons (zone table and object caches),
//! the boot-time initialization order, and the boundary API the rest of the
//! kernel calls into. The pieces themselves live in their own crates:
//! [`kernel_pmm`] for physical pages, [`kernel_object_cache`] for small
//! objects, [`kernel_vmem`] for per-task address spaces.
//!
//! Initialization is strictly ordered: the zone table must exist before the
//! caches ([`kernel_object_cache::ZonesReady`]), and the caches before the
//! first address space ([`CachesReady`]); both are enforced at compile time.
//! Boundary calls before [`init`] halt at run time.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod api;
mod allocator;

pub use allocator::KernelAllocator;
pub use kernel_pmm::{BootInfo, ZoneId, ZoneStats};
pub use kernel_vmem::FaultVerdict;

use kernel_addresses::TaskId;
use kernel_object_cache::{CacheTable, ZoneTableExt};
use kernel_pmm::ZoneTable;
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_vmem::{AddressSpace, AddressSpaceLayout};

static ZONES: SyncOnceCell<SpinLock<ZoneTable>> = SyncOnceCell::new();
static CACHES: SyncOnceCell<SpinLock<CacheTable>> = SyncOnceCell::new();

/// Errors from [`init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    /// The memory core was already brought up.
    #[error("memory core initialized twice")]
    AlreadyInitialized,
}

/// Proof the object caches are online.
///
/// Handed out only by [`init`] and required by [`new_address_space`]:
/// address spaces keep their region map in `alloc` collections, which route
/// through the caches, so no address space can exist before them.
#[derive(Copy, Clone)]
pub struct CachesReady(());

/// Brings the memory core up: zones first, then the object caches.
///
/// # Errors
///
/// [`InitError::AlreadyInitialized`] on a second call.
///
/// # Safety
///
/// `boot` must describe physical memory truthfully, and the linear-mapped
/// window starting at `boot.virt_base` must cover all of it and stay unused
/// by anything else from here on.
pub unsafe fn init(boot: &BootInfo) -> Result<CachesReady, InitError> {
    // SAFETY: forwarded caller contract.
    let zones = unsafe { ZoneTable::new(boot) };
    let ready = zones.ready();
    ZONES
        .set(SpinLock::new(zones))
        .map_err(|_| InitError::AlreadyInitialized)?;
    CACHES
        .set(SpinLock::new(CacheTable::new(ready)))
        .map_err(|_| InitError::AlreadyInitialized)?;
    log::info!("memory core online");
    Ok(CachesReady(()))
}

/// Creates an empty address space for `task`.
#[must_use]
pub fn new_address_space(
    _caches: CachesReady,
    task: TaskId,
    layout: AddressSpaceLayout,
) -> AddressSpace {
    AddressSpace::new(task, layout)
}

#[cold]
fn not_initialized() -> ! {
    panic!("memory core used before init");
}

pub(crate) fn zones() -> &'static SpinLock<ZoneTable> {
    ZONES.get().unwrap_or_else(|| not_initialized())
}

pub(crate) fn caches() -> &'static SpinLock<CacheTable> {
    CACHES.get().unwrap_or_else(|| not_initialized())
}
