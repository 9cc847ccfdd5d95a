//! The cache table: per-class group lists and the allocate/free/shrink
//! operations.

use crate::classes::{CLASS_COUNT, CLASS_SIZES, GroupGeometry, class_for, geometry_for};
use crate::group::{GroupHeader, GroupList};
use crate::CacheError;
use core::mem::size_of;
use core::ptr::NonNull;
use kernel_addresses::VirtAddr;
use kernel_pmm::{PageOwner, PmmError, ZoneId, ZoneTable};

#[cold]
fn corrupt_state(what: &str) -> ! {
    log::error!("object cache corruption: {what}");
    panic!("object cache corruption: {what}");
}

/// One size class: its geometry plus the three disjoint group lists.
struct ObjectCache {
    object_size: u32,
    geometry: GroupGeometry,
    full: GroupList,
    partial: GroupList,
    free: GroupList,
}

impl ObjectCache {
    fn new(object_size: usize) -> Self {
        Self {
            object_size: object_size as u32,
            geometry: geometry_for(object_size, size_of::<GroupHeader>()),
            full: GroupList::new(),
            partial: GroupList::new(),
            free: GroupList::new(),
        }
    }
}

/// Point-in-time counters for one size class.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Object size served by the class.
    pub object_size: u32,
    /// Slots per group.
    pub capacity: u32,
    /// Groups with no free slot.
    pub full_groups: u32,
    /// Groups with both used and free slots.
    pub partial_groups: u32,
    /// Groups with no used slot (eligible for shrink).
    pub free_groups: u32,
}

/// Proof that the zone table exists; caches allocate their groups from it.
///
/// Constructed only by [`ZoneTable::ready`] — requiring it in
/// [`CacheTable::new`] makes the boot order (zones before caches) a
/// compile-time property.
#[derive(Copy, Clone)]
pub struct ZonesReady(pub(crate) ());

/// Extension constructing the readiness token from a live zone table.
pub trait ZoneTableExt {
    /// Token certifying the zone table has been built.
    fn ready(&self) -> ZonesReady;
}

impl ZoneTableExt for ZoneTable {
    fn ready(&self) -> ZonesReady {
        ZonesReady(())
    }
}

/// The kernel-wide set of object caches, one per size class.
pub struct CacheTable {
    classes: [ObjectCache; CLASS_COUNT],
}

// SAFETY: the intrusive group pointers are only dereferenced while the
// table is borrowed mutably, which callers serialize under the cache lock.
unsafe impl Send for CacheTable {}

impl CacheTable {
    /// Build the class table. Groups are created lazily on first pressure.
    #[must_use]
    pub fn new(_zones: ZonesReady) -> Self {
        Self {
            classes: core::array::from_fn(|class| ObjectCache::new(CLASS_SIZES[class])),
        }
    }

    /// Counters for `class`.
    #[must_use]
    pub fn stats(&self, class: u8) -> CacheStats {
        let cache = &self.classes[class as usize];
        CacheStats {
            object_size: cache.object_size,
            capacity: cache.geometry.capacity,
            full_groups: cache.full.len,
            partial_groups: cache.partial.len,
            free_groups: cache.free.len,
        }
    }

    /// Smallest class serving `size`.
    ///
    /// # Errors
    /// [`CacheError::BadSize`] past the largest class.
    pub fn class_for(size: usize) -> Result<u8, CacheError> {
        class_for(size)
    }

    /// Allocate one object of at least `size` bytes.
    ///
    /// # Errors
    /// [`CacheError::BadSize`] for oversized requests;
    /// [`CacheError::OutOfMemory`] when a new group is needed and the
    /// dynamic zone cannot back it.
    pub fn allocate(&mut self, zones: &mut ZoneTable, size: usize) -> Result<NonNull<u8>, CacheError> {
        let class = class_for(size)?;
        let cache = &mut self.classes[class as usize];

        if cache.partial.head.is_null() {
            if let Some(group) = cache.free.pop() {
                // SAFETY: `group` came off this cache's free list.
                unsafe { cache.partial.push(group) };
            } else {
                let group = Self::create_group(zones, class, cache)?;
                // SAFETY: freshly initialized, not yet on any list.
                unsafe { cache.partial.push(group) };
            }
        }

        let group = cache.partial.head;
        // SAFETY: list heads are live in-band headers; the table borrow is
        // exclusive.
        let header = unsafe { &mut *group };
        let Some(slot) = header.slots().first_clear() else {
            corrupt_state("partial group has no free slot");
        };
        header.slots().set(slot);
        header.used += 1;

        if header.used == header.capacity {
            // SAFETY: `group` is the head of `partial`.
            unsafe {
                cache.partial.remove(group);
                cache.full.push(group);
            }
        }

        NonNull::new(header.object_at(slot).as_mut_ptr())
            .map_or_else(|| corrupt_state("object at null address"), Ok)
    }

    /// Release the object at `object`.
    ///
    /// # Panics
    /// Halts on any pointer that does not resolve to a live slot: an
    /// ownership tag inconsistent with its page is kernel corruption, not a
    /// recoverable error.
    pub fn free(&mut self, zones: &mut ZoneTable, object: NonNull<u8>) {
        let va = VirtAddr::from_ptr(object.as_ptr());
        let Some(pa) = zones.phys_of_virt(va) else {
            corrupt_state("freed pointer outside the linear map");
        };
        let Some(PageOwner::Cache { class, group }) = zones.owner_of(pa) else {
            corrupt_state("freed pointer's page is not cache-owned");
        };
        let Some(group_va) = zones.virt(group) else {
            corrupt_state("group tag points outside every zone");
        };

        let cache = &mut self.classes[class as usize];
        let group = group_va.as_mut_ptr::<GroupHeader>();
        // SAFETY: the page tag certifies `group` heads a live group of this
        // class; the table borrow is exclusive.
        let header = unsafe { &mut *group };
        if header.class != class {
            corrupt_state("group header and page tag disagree");
        }
        let Some(slot) = header.slot_of(va) else {
            corrupt_state("freed pointer is not a slot base");
        };
        if !header.slots().test(slot) {
            corrupt_state("double free of an object slot");
        }

        let was_full = header.used == header.capacity;
        header.slots().clear(slot);
        header.used -= 1;

        // SAFETY: membership follows from the occupancy the group had
        // before this free.
        unsafe {
            if was_full {
                cache.full.remove(group);
                cache.partial.push(group);
            }
            if header.used == 0 {
                cache.partial.remove(group);
                cache.free.push(group);
            }
        }
    }

    /// Destroy every fully free group, returning its pages to the buddy
    /// allocator. Explicit reclaim only; nothing shrinks automatically.
    ///
    /// Returns the number of pages released.
    pub fn shrink(&mut self, zones: &mut ZoneTable) -> u64 {
        let mut released = 0u64;
        for cache in &mut self.classes {
            while let Some(group) = cache.free.pop() {
                // SAFETY: the group was on the free list and is now
                // unlinked; its header stays valid until the pages are
                // returned below.
                let (phys, order) = unsafe { ((*group).phys, (*group).order) };
                match zones.free(phys, order) {
                    Ok(()) => released += 1u64 << order,
                    Err(err) => corrupt_state_on_free(err),
                }
            }
        }
        released
    }

    fn create_group(
        zones: &mut ZoneTable,
        class: u8,
        cache: &ObjectCache,
    ) -> Result<*mut GroupHeader, CacheError> {
        let geometry = cache.geometry;
        let phys = zones
            .allocate(ZoneId::Dynamic, geometry.order)
            .map_err(|_| CacheError::OutOfMemory)?;
        if zones
            .tag_pages(phys, 1 << geometry.order, PageOwner::Cache { class, group: phys })
            .is_err()
        {
            corrupt_state("fresh group pages outside the zone");
        }
        let Some(base) = zones.virt(phys) else {
            corrupt_state("fresh group has no linear mapping");
        };
        log::debug!(
            "class {}: new group at {} (order {}, capacity {})",
            cache.object_size,
            phys,
            geometry.order,
            geometry.capacity
        );
        // SAFETY: the block was just allocated and tagged; it is writable,
        // exclusive, and `base` is its linear-map address.
        Ok(unsafe { GroupHeader::init(base, class, cache.object_size, geometry, phys) })
    }
}

#[cold]
fn corrupt_state_on_free(err: PmmError) -> ! {
    corrupt_state(match err {
        PmmError::UnknownAddress(_) => "group backing pages outside every zone",
        _ => "group backing pages failed to free",
    })
}
