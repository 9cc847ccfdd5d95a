//! Buddy allocation over one zone.
//!
//! Blocks are identified by the arena index of their first page, taken
//! relative to the zone start, so the sibling of a block at order `k` is
//! always `index ^ (1 << k)` ([`kernel_bitvec::buddy_index`]). Allocation
//! splits the first sufficiently large block downward; freeing merges with
//! the sibling for as long as the sibling is itself whole on its order's
//! free list. Both directions touch at most `MAX_ORDER` list heads, never
//! the whole page arena.

use crate::page::{NIL, PageOwner};
use crate::zone::Zone;
use crate::{MAX_ORDER, PmmError, corrupt_state};
use kernel_bitvec::buddy_index;

impl Zone {
    /// Take one `2^order`-page block out of the zone.
    pub(crate) fn allocate_block(&mut self, order: u8) -> Result<u32, PmmError> {
        if order >= MAX_ORDER {
            return Err(PmmError::InvalidOrder(order));
        }
        let found = (order..MAX_ORDER)
            .find(|&o| self.free_areas[o as usize].head != NIL)
            .ok_or(PmmError::OutOfMemory {
                zone: self.id(),
                order,
            })?;

        let index = self.free_areas[found as usize].head;
        self.unlink_free(index, found);

        // Split down to the requested order, keeping the lower half as the
        // candidate and returning each upper half to its order's list.
        let mut split = found;
        while split > order {
            split -= 1;
            self.insert_free(index + (1 << split), split);
        }

        self.pages[index as usize].owner = PageOwner::Allocated { order };
        self.free_pages -= 1u64 << order;
        Ok(index)
    }

    /// Return the block headed by `index` at `order`, coalescing upward.
    pub(crate) fn free_block(&mut self, index: u32, order: u8) -> Result<(), PmmError> {
        if order >= MAX_ORDER {
            return Err(PmmError::InvalidOrder(order));
        }
        let span = 1u32 << order;
        if index % span != 0 || u64::from(index) + u64::from(span) > self.page_count() {
            return Err(PmmError::MisalignedBlock { index, order });
        }
        let head = self.pages[index as usize].owner;
        match head {
            PageOwner::Free { .. } => corrupt_state("double free of a buddy block"),
            PageOwner::Tail => corrupt_state("free targets the interior of a block"),
            PageOwner::Allocated { order: tagged } if tagged != order => {
                corrupt_state("freed order disagrees with the allocation tag")
            }
            PageOwner::Allocated { .. } | PageOwner::Cache { .. } | PageOwner::Mapped { .. } => {}
        }
        // An allocated block covers its span with `Tail` pages; a retagged
        // one (cache group, mapped frame) carries the head's tag on every
        // page. Anything else means the span reaches into a neighbor.
        for page in &self.pages[(index + 1) as usize..(index + span) as usize] {
            let owned = match head {
                PageOwner::Allocated { .. } => page.owner == PageOwner::Tail,
                _ => page.owner == head,
            };
            if !owned {
                corrupt_state("freed block spans pages it does not own");
            }
        }
        // Drop whatever ownership tag the block carried.
        for page in &mut self.pages[index as usize..(index + span) as usize] {
            page.owner = PageOwner::Tail;
        }

        let mut index = index;
        let mut merged = order;
        while merged + 1 < MAX_ORDER {
            let buddy = buddy_index(index as usize, merged) as u32;
            if !self.block_is_free(buddy, merged) {
                break;
            }
            self.unlink_free(buddy, merged);
            index = index.min(buddy);
            merged += 1;
        }

        self.insert_free(index, merged);
        self.free_pages += 1u64 << order;
        Ok(())
    }

    /// Seed the free lists with maximal aligned blocks covering
    /// `[start, end)`. Used once per zone at boot, after the reserved
    /// prefix and bookkeeping pages have been excised.
    pub(crate) fn release_range(&mut self, start: u32, end: u32) {
        let mut index = start;
        while index < end {
            let align = if index == 0 {
                MAX_ORDER - 1
            } else {
                (index.trailing_zeros() as u8).min(MAX_ORDER - 1)
            };
            let mut order = align;
            while u64::from(index) + (1u64 << order) > u64::from(end) {
                order -= 1;
            }
            self.insert_free(index, order);
            self.free_pages += 1u64 << order;
            index += 1u32 << order;
        }
    }

    /// Whether the block headed by `index` is present whole on the
    /// `order` free list. Blocks reaching past the zone end are never free.
    fn block_is_free(&self, index: u32, order: u8) -> bool {
        if u64::from(index) + (1u64 << order) > self.page_count() {
            return false;
        }
        !self.free_areas[order as usize].map.test((index >> order) as usize)
    }

    /// Push a block onto its order's list and clear the order bit.
    fn insert_free(&mut self, index: u32, order: u8) {
        let area = &mut self.free_areas[order as usize];
        let old_head = area.head;
        area.head = index;
        area.map.clear((index >> order) as usize);

        let page = &mut self.pages[index as usize];
        page.owner = PageOwner::Free { order };
        page.next_free = old_head;
        page.prev_free = NIL;
        if old_head != NIL {
            self.pages[old_head as usize].prev_free = index;
        }
    }

    /// Remove a block from its order's list and set the order bit.
    fn unlink_free(&mut self, index: u32, order: u8) {
        let page = self.pages[index as usize];
        if page.owner != (PageOwner::Free { order }) {
            corrupt_state("free list and ownership tag disagree");
        }
        if page.prev_free == NIL {
            self.free_areas[order as usize].head = page.next_free;
        } else {
            self.pages[page.prev_free as usize].next_free = page.next_free;
        }
        if page.next_free != NIL {
            self.pages[page.next_free as usize].prev_free = page.prev_free;
        }
        self.free_areas[order as usize].map.set((index >> order) as usize);

        let page = &mut self.pages[index as usize];
        page.owner = PageOwner::Tail;
        page.next_free = NIL;
        page.prev_free = NIL;
    }
}
