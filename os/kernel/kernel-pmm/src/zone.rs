//! Physical memory zones.
//!
//! At boot, physical memory is split into a low [`ZoneId::Static`] zone and a
//! high [`ZoneId::Dynamic`] zone. Each zone owns a page-descriptor arena and
//! one free-area (free list + bitmap) per allocation order, all carved from
//! the zone's own prefix by a [`BootAllocator`]; the pages consumed by the
//! kernel image and by that bookkeeping are excised before the free lists
//! are seeded.
//!
//! Every lookup here fails closed: an address outside the configured ranges
//! yields `None` (or [`PmmError::UnknownAddress`]), never an out-of-bounds
//! read.

use crate::boot::BootAllocator;
use crate::page::{NIL, PageDescriptor, PageOwner};
use crate::{MAX_ORDER, PmmError, corrupt_state};
use kernel_addresses::{PAGE_SIZE, PhysAddr, VirtAddr, pages_for};
use kernel_bitvec::{BitVec, words_for};

/// Fewest free pages the dynamic zone must end up with after boot; anything
/// less cannot run the object cache and is a fatal configuration.
pub const MIN_DYNAMIC_FREE_PAGES: u64 = 32;

/// Physical memory description handed to [`ZoneTable::new`] by early boot.
#[derive(Copy, Clone, Debug)]
pub struct BootInfo {
    /// Total physical memory, in bytes (page aligned).
    pub phys_size: u64,
    /// Prefix already occupied by the kernel image, in bytes.
    pub kernel_reserved: u64,
    /// Bytes assigned to the static zone; the rest forms the dynamic zone.
    pub static_zone_size: u64,
    /// Virtual address at which physical address zero is linearly mapped.
    pub virt_base: VirtAddr,
}

/// Zone names. The static zone holds boot-lifetime structures; the dynamic
/// zone serves the object cache and task mappings.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ZoneId {
    /// Low zone.
    Static,
    /// High zone.
    Dynamic,
}

/// Handle to one page descriptor: its zone plus the index in that zone's
/// descriptor arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageRef {
    /// Zone owning the descriptor.
    pub zone: ZoneId,
    /// Index into the zone's descriptor arena.
    pub index: u32,
}

/// Point-in-time page counters for one zone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ZoneStats {
    /// Pages in the zone, including reserved and bookkeeping pages.
    pub total: u64,
    /// Pages not currently on any free list.
    pub used: u64,
    /// Pages available for allocation.
    pub free: u64,
}

/// One allocation order's free blocks: an intrusive list threaded through
/// the descriptor arena plus the order's bitmap.
///
/// Bitmap semantics: the bit for a block is **set** iff the block is not
/// present whole on this order's free list (allocated, split, or part of a
/// larger block).
pub(crate) struct FreeArea {
    /// Page index of the first free block, or `NIL`.
    pub(crate) head: u32,
    pub(crate) map: BitVec<'static>,
}

/// A contiguous sub-range of physical memory with its own buddy state.
pub struct Zone {
    id: ZoneId,
    /// Physical range `[start, end)`, page aligned.
    start: PhysAddr,
    end: PhysAddr,
    /// Virtual address of `start` under the linear mapping.
    virt_base: VirtAddr,
    pub(crate) pages: &'static mut [PageDescriptor],
    pub(crate) free_areas: [FreeArea; MAX_ORDER as usize],
    pub(crate) free_pages: u64,
}

#[cold]
fn sizing_failure(what: &str) -> ! {
    log::error!("boot zone sizing failed: {what}");
    panic!("boot zone sizing failed: {what}");
}

impl Zone {
    /// Build one zone over `[start, end)`, excising `reserved` prefix bytes.
    ///
    /// # Safety
    /// The physical range must be linearly mapped at `virt_base`, writable,
    /// and not in use beyond the declared `reserved` prefix.
    ///
    /// # Panics
    /// Halts when the range cannot hold its own bookkeeping.
    unsafe fn new(id: ZoneId, start: PhysAddr, end: PhysAddr, virt_base: VirtAddr, reserved: u64) -> Self {
        assert!(start.is_page_aligned() && end.is_page_aligned());
        let page_count = (end - start) / PAGE_SIZE;
        assert!(u32::try_from(page_count).is_ok(), "zone exceeds descriptor index range");

        let reserved = kernel_addresses::align_up(reserved.min(end - start), PAGE_SIZE);
        // SAFETY: forwarded from our own contract; the bump range starts
        // past the reserved prefix.
        let mut boot = unsafe { BootAllocator::new(virt_base + reserved, (end - start) - reserved) };

        let Some(pages) = boot.alloc_slice(page_count as usize, PageDescriptor::new()) else {
            sizing_failure("page descriptor arena does not fit");
        };
        let free_areas = core::array::from_fn(|order| {
            let bits = ((page_count as usize) + (1 << order) - 1) >> order;
            // All bits set: nothing is free until the lists are seeded.
            let Some(words) = boot.alloc_slice::<u64>(words_for(bits), u64::MAX) else {
                sizing_failure("order bitmaps do not fit");
            };
            FreeArea {
                head: NIL,
                map: BitVec::new(words, bits),
            }
        });

        let first_free = pages_for(reserved + boot.used());
        let mut zone = Self {
            id,
            start,
            end,
            virt_base,
            pages,
            free_areas,
            free_pages: 0,
        };
        if first_free < page_count {
            zone.release_range(first_free as u32, page_count as u32);
        }
        log::info!(
            "zone {:?}: {} pages at {}, {} reserved/bookkeeping, {} free",
            id,
            page_count,
            start,
            first_free,
            zone.free_pages
        );
        zone
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> ZoneId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        (self.end.as_u64() - self.start.as_u64()) / PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn free_pages(&self) -> u64 {
        self.free_pages
    }

    #[must_use]
    pub const fn stats(&self) -> ZoneStats {
        let total = self.page_count();
        ZoneStats {
            total,
            used: total - self.free_pages,
            free: self.free_pages,
        }
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysAddr) -> bool {
        self.start.as_u64() <= pa.as_u64() && pa.as_u64() < self.end.as_u64()
    }

    /// Descriptor index of the page containing `pa`, if inside the zone.
    #[must_use]
    pub fn page_index(&self, pa: PhysAddr) -> Option<u32> {
        if self.contains(pa) {
            Some(((pa.page_base() - self.start) / PAGE_SIZE) as u32)
        } else {
            None
        }
    }

    /// Physical base address of page `index`, if inside the zone.
    #[must_use]
    pub fn phys_of_index(&self, index: u32) -> Option<PhysAddr> {
        if u64::from(index) < self.page_count() {
            Some(self.start + u64::from(index) * PAGE_SIZE)
        } else {
            None
        }
    }

    /// Linear-map virtual address of `pa`, if inside the zone.
    #[must_use]
    pub fn virt_of_phys(&self, pa: PhysAddr) -> Option<VirtAddr> {
        if self.contains(pa) {
            Some(self.virt_base + (pa - self.start))
        } else {
            None
        }
    }

    /// Inverse of [`virt_of_phys`](Self::virt_of_phys), failing closed.
    #[must_use]
    pub fn phys_of_virt(&self, va: VirtAddr) -> Option<PhysAddr> {
        let size = self.end - self.start;
        if self.virt_base.as_u64() <= va.as_u64() && va.as_u64() < self.virt_base.as_u64() + size {
            Some(self.start + (va - self.virt_base))
        } else {
            None
        }
    }
}

/// The kernel-wide zone set, built once at boot.
pub struct ZoneTable {
    zones: [Zone; 2],
}

impl ZoneTable {
    /// Compute the zone split and construct both zones.
    ///
    /// # Safety
    /// `boot.phys_size` bytes of physical memory must be linearly mapped at
    /// `boot.virt_base` and unused beyond the `kernel_reserved` prefix.
    ///
    /// # Panics
    /// Halts when the configuration cannot satisfy the minimum memory
    /// requirement; there is no smaller configuration to fall back to.
    #[must_use]
    pub unsafe fn new(boot: &BootInfo) -> Self {
        let static_end = kernel_addresses::align_up(boot.static_zone_size, PAGE_SIZE);
        let phys_end = kernel_addresses::align_down(boot.phys_size, PAGE_SIZE);
        if phys_end <= static_end + MIN_DYNAMIC_FREE_PAGES * PAGE_SIZE {
            sizing_failure("physical memory smaller than static zone plus dynamic minimum");
        }

        // The kernel image occupies a prefix of physical memory; split the
        // reservation across whichever zones it covers.
        let static_reserved = boot.kernel_reserved.min(static_end);
        let dynamic_reserved = boot.kernel_reserved.saturating_sub(static_end);

        // SAFETY: forwarded from our own contract.
        let zones = unsafe {
            [
                Zone::new(
                    ZoneId::Static,
                    PhysAddr::zero(),
                    PhysAddr::new(static_end),
                    boot.virt_base,
                    static_reserved,
                ),
                Zone::new(
                    ZoneId::Dynamic,
                    PhysAddr::new(static_end),
                    PhysAddr::new(phys_end),
                    boot.virt_base + static_end,
                    dynamic_reserved,
                ),
            ]
        };

        let table = Self { zones };
        if table.zone(ZoneId::Dynamic).free_pages() < MIN_DYNAMIC_FREE_PAGES {
            sizing_failure("dynamic zone below minimum free pages");
        }
        table
    }

    #[inline]
    #[must_use]
    pub const fn zone(&self, id: ZoneId) -> &Zone {
        &self.zones[id as usize]
    }

    #[inline]
    pub const fn zone_mut(&mut self, id: ZoneId) -> &mut Zone {
        &mut self.zones[id as usize]
    }

    /// Zone containing `pa`, if any.
    #[must_use]
    pub fn zone_by_phys(&self, pa: PhysAddr) -> Option<ZoneId> {
        self.zones.iter().find(|z| z.contains(pa)).map(Zone::id)
    }

    /// Descriptor handle for the page containing `pa`.
    #[must_use]
    pub fn phys_to_page(&self, pa: PhysAddr) -> Option<PageRef> {
        let zone = self.zone(self.zone_by_phys(pa)?);
        Some(PageRef {
            zone: zone.id(),
            index: zone.page_index(pa)?,
        })
    }

    /// Physical base address of the page behind `page`.
    #[must_use]
    pub fn page_to_phys(&self, page: PageRef) -> Option<PhysAddr> {
        self.zone(page.zone).phys_of_index(page.index)
    }

    /// Current owner tag of the page containing `pa`.
    #[must_use]
    pub fn owner_of(&self, pa: PhysAddr) -> Option<PageOwner> {
        let page = self.phys_to_page(pa)?;
        Some(self.zone(page.zone).pages[page.index as usize].owner)
    }

    /// Linear-map virtual address of `pa`.
    #[must_use]
    pub fn virt(&self, pa: PhysAddr) -> Option<VirtAddr> {
        self.zones.iter().find_map(|z| z.virt_of_phys(pa))
    }

    /// Physical address behind a linear-map virtual address.
    #[must_use]
    pub fn phys_of_virt(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.zones.iter().find_map(|z| z.phys_of_virt(va))
    }

    /// Allocate a block of `2^order` contiguous pages from `zone`.
    ///
    /// # Errors
    /// [`PmmError::InvalidOrder`] for `order >= MAX_ORDER`;
    /// [`PmmError::OutOfMemory`] when no order from `order` upward has a
    /// free block.
    pub fn allocate(&mut self, zone: ZoneId, order: u8) -> Result<PhysAddr, PmmError> {
        let zone = self.zone_mut(zone);
        let index = zone.allocate_block(order)?;
        Ok(zone.phys_of_index(index).unwrap_or_else(|| corrupt_state("allocated index out of zone")))
    }

    /// Return the block of `2^order` pages at `pa` to its zone, coalescing
    /// with free buddies.
    ///
    /// # Errors
    /// [`PmmError::UnknownAddress`] when `pa` lies outside every zone (a
    /// caller contract violation, rejected rather than corrupting a bitmap);
    /// [`PmmError::MisalignedBlock`] when `pa` is not the base of an
    /// `order`-sized block.
    pub fn free(&mut self, pa: PhysAddr, order: u8) -> Result<(), PmmError> {
        if !pa.is_page_aligned() {
            return Err(PmmError::UnknownAddress(pa));
        }
        let id = self.zone_by_phys(pa).ok_or(PmmError::UnknownAddress(pa))?;
        let zone = self.zone_mut(id);
        let index = zone.page_index(pa).ok_or(PmmError::UnknownAddress(pa))?;
        zone.free_block(index, order)
    }

    /// Retag a run of `count` pages starting at `start` with `owner`.
    ///
    /// Used by the object cache and the mapping layer after taking pages
    /// from the buddy allocator.
    ///
    /// # Errors
    /// [`PmmError::UnknownAddress`] when the run leaves the configured
    /// zones.
    ///
    /// # Panics
    /// Halts when a page in the run is currently on a free list; retagging
    /// free memory means the caller and the allocator disagree about
    /// ownership.
    pub fn tag_pages(&mut self, start: PhysAddr, count: u64, owner: PageOwner) -> Result<(), PmmError> {
        let id = self.zone_by_phys(start).ok_or(PmmError::UnknownAddress(start))?;
        let zone = self.zone_mut(id);
        let first = zone.page_index(start).ok_or(PmmError::UnknownAddress(start))?;
        if u64::from(first) + count > zone.page_count() {
            return Err(PmmError::UnknownAddress(start + (count - 1) * PAGE_SIZE));
        }
        for index in first..first + count as u32 {
            let descriptor = &mut zone.pages[index as usize];
            if matches!(descriptor.owner, PageOwner::Free { .. }) {
                corrupt_state("retagging a page that is on a free list");
            }
            descriptor.owner = owner;
        }
        Ok(())
    }
}
