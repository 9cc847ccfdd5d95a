//! The sorted region set and the operations over it.

use alloc::collections::BTreeMap;

use kernel_addresses::{PAGE_SIZE, TaskId, VirtAddr, align_up};

use crate::region::{Access, MapFlags, Protection, Region, RegionKind};
use crate::{FaultVerdict, FrameAlloc, PageTables, VmError};

/// Fixed bounds of one task's address space.
///
/// The heap window `[heap_start, heap_ceiling)` must lie inside
/// `[floor, ceiling)`; all four addresses are page aligned.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpaceLayout {
    /// Lowest mappable address. Keeping this above zero leaves the null page
    /// permanently unmapped.
    pub floor: VirtAddr,

    /// First address past the mappable range.
    pub ceiling: VirtAddr,

    /// Bottom of the heap window; the initial program break.
    pub heap_start: VirtAddr,

    /// Hard upper bound the program break may never cross.
    pub heap_ceiling: VirtAddr,
}

/// One task's virtual address space.
///
/// Regions are kept in a map ordered by start address. Two invariants hold
/// between operations: no two regions overlap, and no two adjacent regions
/// share both kind and protection (such pairs are merged on insert).
pub struct AddressSpace {
    task: TaskId,
    regions: BTreeMap<VirtAddr, Region>,
    layout: AddressSpaceLayout,
    /// Exact (byte-granular) program break. The heap region ends at the page
    /// boundary above this.
    heap_break: VirtAddr,
}

impl AddressSpace {
    /// Creates an empty address space for `task`.
    #[must_use]
    pub fn new(task: TaskId, layout: AddressSpaceLayout) -> Self {
        Self {
            task,
            regions: BTreeMap::new(),
            layout,
            heap_break: layout.heap_start,
        }
    }

    /// The task this space belongs to.
    #[must_use]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// The current program break, byte exact.
    #[must_use]
    pub fn heap_break(&self) -> VirtAddr {
        self.heap_break
    }

    /// Iterates the regions in ascending address order.
    #[must_use]
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Maps `len` bytes (rounded up to whole pages) and returns the chosen
    /// start address. Without [`MapFlags::fixed`] the request is placed at the
    /// first gap large enough; with it, `addr` is taken literally.
    ///
    /// No frames are bound here; pages populate on first fault.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] for a zero length or an unusable fixed
    /// address, [`VmError::AddressInUse`] when a fixed request collides with
    /// an existing region, and [`VmError::OutOfMemory`] when no gap fits.
    pub fn mmap(
        &mut self,
        addr: VirtAddr,
        len: u64,
        prot: Protection,
        kind: RegionKind,
        flags: MapFlags,
    ) -> Result<VirtAddr, VmError> {
        if len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let len = align_up(len, PAGE_SIZE);

        let start = if flags.fixed() {
            if !addr.is_page_aligned() || addr < self.layout.floor {
                return Err(VmError::InvalidArgument);
            }
            let end = addr
                .as_u64()
                .checked_add(len)
                .ok_or(VmError::InvalidArgument)?;
            if end > self.layout.ceiling.as_u64() {
                return Err(VmError::InvalidArgument);
            }
            if self.overlaps(addr, VirtAddr::new(end)) {
                return Err(VmError::AddressInUse);
            }
            addr
        } else {
            self.find_gap(len).ok_or(VmError::OutOfMemory)?
        };

        self.insert_region(Region {
            start,
            end: start + len,
            prot,
            kind,
        });
        log::debug!("{}: mapped {len:#x} bytes at {start:?}", self.task);
        Ok(start)
    }

    /// Unmaps `[addr, addr + len)`, releasing any frames bound inside it.
    ///
    /// The range must fall within a single region; a region is split when a
    /// proper interior span is removed. Nothing changes on error.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] for a misaligned address or zero length,
    /// [`VmError::PartialOverlap`] when the range is not covered by exactly
    /// one region.
    pub fn munmap(
        &mut self,
        pt: &mut impl PageTables,
        frames: &mut impl FrameAlloc,
        addr: VirtAddr,
        len: u64,
    ) -> Result<(), VmError> {
        if len == 0 || !addr.is_page_aligned() {
            return Err(VmError::InvalidArgument);
        }
        let len = align_up(len, PAGE_SIZE);
        let end = addr
            .as_u64()
            .checked_add(len)
            .ok_or(VmError::InvalidArgument)?;
        if end > self.layout.ceiling.as_u64() {
            return Err(VmError::InvalidArgument);
        }
        let end = VirtAddr::new(end);

        let region = self
            .region_ending_after(addr)
            .ok_or(VmError::PartialOverlap)?;
        if addr < region.start || end > region.end {
            return Err(VmError::PartialOverlap);
        }

        self.carve(region, addr, end);
        Self::unmap_pages(pt, frames, addr, end);
        log::debug!("{}: unmapped [{addr:?}, {end:?})", self.task);
        Ok(())
    }

    /// Moves the program break to `new_break` and returns the break actually
    /// in effect afterwards.
    ///
    /// Requests below the heap bottom, beyond the heap ceiling, or colliding
    /// with a foreign region are ignored and the previous break is returned.
    /// Growth only extends bookkeeping; shrinking releases the vacated pages.
    pub fn set_break(
        &mut self,
        pt: &mut impl PageTables,
        frames: &mut impl FrameAlloc,
        new_break: VirtAddr,
    ) -> VirtAddr {
        let bottom = self.layout.heap_start;
        if new_break < bottom || new_break > self.layout.heap_ceiling {
            return self.heap_break;
        }

        let old_end = self.heap_break.align_up_to_page();
        let new_end = new_break.align_up_to_page();

        if new_end > old_end {
            // Refuse to grow over anything that is not already our heap tail.
            if self.overlaps(old_end, new_end) {
                return self.heap_break;
            }
            self.insert_region(Region {
                start: old_end,
                end: new_end,
                prot: Protection::read_write(),
                kind: RegionKind::Heap,
            });
        } else if new_end < old_end {
            let Some(region) = self.region_ending_after(new_end) else {
                heap_corrupt();
            };
            if region.kind != RegionKind::Heap || region.end < old_end {
                heap_corrupt();
            }
            self.carve(region, new_end, old_end);
            Self::unmap_pages(pt, frames, new_end, old_end);
        }

        self.heap_break = new_break;
        self.heap_break
    }

    /// Decides a page fault at `va` and binds a fresh frame when the access
    /// is legitimate.
    pub fn handle_fault(
        &mut self,
        pt: &mut impl PageTables,
        frames: &mut impl FrameAlloc,
        va: VirtAddr,
        access: Access,
    ) -> FaultVerdict {
        let Some(region) = self.region_containing(va) else {
            log::warn!("{}: fault at {va:?} outside any region", self.task);
            return FaultVerdict::Fatal;
        };
        if !region.prot.allows(access) {
            log::warn!("{}: {access:?} fault at {va:?} violates protection", self.task);
            return FaultVerdict::Fatal;
        }
        let prot = region.prot;

        let page = va.page_base();
        if pt.translate(page).is_some() {
            // Raced with an earlier bind; the retry will succeed as-is.
            return FaultVerdict::Handled;
        }

        let Some(pa) = frames.alloc_frame() else {
            log::warn!("{}: no frame available for fault at {va:?}", self.task);
            return FaultVerdict::Fatal;
        };
        if pt.map_page(page, pa, prot).is_err() {
            frames.free_frame(pa);
            log::warn!("{}: page table update failed at {va:?}", self.task);
            return FaultVerdict::Fatal;
        }
        log::trace!("{}: bound {pa:?} at {page:?}", self.task);
        FaultVerdict::Handled
    }

    /// Tears the whole address space down, returning every bound frame.
    ///
    /// Used at task exit; the space is afterwards empty with the break reset
    /// to the heap bottom.
    pub fn release_all(&mut self, pt: &mut impl PageTables, frames: &mut impl FrameAlloc) {
        while let Some((_, region)) = self.regions.pop_first() {
            Self::unmap_pages(pt, frames, region.start, region.end);
        }
        self.heap_break = self.layout.heap_start;
        log::debug!("{}: address space released", self.task);
    }

    /// The region whose span contains `va`, if any.
    fn region_containing(&self, va: VirtAddr) -> Option<Region> {
        let (_, region) = self.regions.range(..=va).next_back()?;
        region.contains(va).then_some(*region)
    }

    /// The lowest-ending region with `addr < end`.
    fn region_ending_after(&self, addr: VirtAddr) -> Option<Region> {
        if let Some((_, prev)) = self.regions.range(..=addr).next_back() {
            if prev.end > addr {
                return Some(*prev);
            }
        }
        self.regions.range(addr..).next().map(|(_, r)| *r)
    }

    /// Whether any region intersects `[start, end)`.
    fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        if let Some((_, prev)) = self.regions.range(..=start).next_back() {
            if prev.end > start {
                return true;
            }
        }
        self.regions.range(start..end).next().is_some()
    }

    /// First-fit search for a free span of `len` bytes.
    fn find_gap(&self, len: u64) -> Option<VirtAddr> {
        let mut cursor = self.layout.floor;
        for region in self.regions.values() {
            if region.start >= cursor && region.start - cursor >= len {
                return Some(cursor);
            }
            if region.end > cursor {
                cursor = region.end;
            }
        }
        (self.layout.ceiling >= cursor && self.layout.ceiling - cursor >= len).then_some(cursor)
    }

    /// Inserts a region known not to overlap anything, merging it with
    /// adjacent regions of the same kind and protection.
    fn insert_region(&mut self, mut region: Region) {
        if let Some((&prev_start, prev)) = self.regions.range(..region.start).next_back() {
            if prev.end == region.start && prev.kind == region.kind && prev.prot == region.prot {
                region.start = prev_start;
                self.regions.remove(&prev_start);
            }
        }
        if let Some((&next_start, next)) = self.regions.range(region.end..).next() {
            if next_start == region.end && next.kind == region.kind && next.prot == region.prot {
                region.end = next.end;
                self.regions.remove(&next_start);
            }
        }
        self.regions.insert(region.start, region);
    }

    /// Removes `[cut_start, cut_end)` from `region`, reinserting whatever
    /// remains on either side. The caller has checked containment.
    fn carve(&mut self, region: Region, cut_start: VirtAddr, cut_end: VirtAddr) {
        self.regions.remove(&region.start);
        if region.start < cut_start {
            self.regions.insert(
                region.start,
                Region {
                    end: cut_start,
                    ..region
                },
            );
        }
        if cut_end < region.end {
            self.regions.insert(
                cut_end,
                Region {
                    start: cut_end,
                    ..region
                },
            );
        }
    }

    /// Unbinds every page in `[start, end)` and returns its frame.
    fn unmap_pages(
        pt: &mut impl PageTables,
        frames: &mut impl FrameAlloc,
        start: VirtAddr,
        end: VirtAddr,
    ) {
        let mut va = start;
        while va < end {
            if let Some(pa) = pt.unmap_page(va) {
                pt.invalidate(va);
                frames.free_frame(pa);
            }
            va += PAGE_SIZE;
        }
    }
}

/// The heap region disagreed with the recorded break.
fn heap_corrupt() -> ! {
    log::error!("memory corruption: heap region does not back the program break");
    panic!("memory corruption: heap region does not back the program break");
}
