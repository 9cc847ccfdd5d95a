//! Address space behavior tests against mock page tables and frames.

use std::collections::BTreeMap;

use kernel_addresses::{PAGE_SIZE, PhysAddr, TaskId, VirtAddr};
use kernel_vmem::{
    Access, AddressSpace, AddressSpaceLayout, FaultVerdict, FrameAlloc, MapFlags, PageTables,
    Protection, Region, RegionKind, VmError,
};

const FLOOR: u64 = 0x1000;
const CEILING: u64 = 0x0100_0000;
const HEAP_START: u64 = 0x10000;
const HEAP_CEILING: u64 = 0x80000;

/// Page tables as a plain map from page base to frame base.
#[derive(Default)]
struct MockTables {
    bound: BTreeMap<u64, u64>,
    flushes: usize,
}

impl PageTables for MockTables {
    fn map_page(&mut self, va: VirtAddr, pa: PhysAddr, _prot: Protection) -> Result<(), VmError> {
        assert!(va.is_page_aligned());
        assert!(
            self.bound.insert(va.as_u64(), pa.as_u64()).is_none(),
            "page mapped twice"
        );
        Ok(())
    }

    fn unmap_page(&mut self, va: VirtAddr) -> Option<PhysAddr> {
        self.bound.remove(&va.as_u64()).map(PhysAddr::new)
    }

    fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.bound
            .get(&va.page_base().as_u64())
            .copied()
            .map(PhysAddr::new)
    }

    fn invalidate(&mut self, _va: VirtAddr) {
        self.flushes += 1;
    }
}

/// Bump allocator with a recycle stack and a hard budget.
struct MockFrames {
    next: u64,
    recycled: Vec<u64>,
    outstanding: usize,
    budget: usize,
}

impl MockFrames {
    fn with_budget(budget: usize) -> Self {
        Self {
            next: 0x0020_0000,
            recycled: Vec::new(),
            outstanding: 0,
            budget,
        }
    }
}

impl FrameAlloc for MockFrames {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        if self.outstanding >= self.budget {
            return None;
        }
        self.outstanding += 1;
        let pa = self.recycled.pop().unwrap_or_else(|| {
            let pa = self.next;
            self.next += PAGE_SIZE;
            pa
        });
        Some(PhysAddr::new(pa))
    }

    fn free_frame(&mut self, pa: PhysAddr) {
        self.outstanding -= 1;
        self.recycled.push(pa.as_u64());
    }
}

fn space() -> AddressSpace {
    AddressSpace::new(
        TaskId(7),
        AddressSpaceLayout {
            floor: VirtAddr::new(FLOOR),
            ceiling: VirtAddr::new(CEILING),
            heap_start: VirtAddr::new(HEAP_START),
            heap_ceiling: VirtAddr::new(HEAP_CEILING),
        },
    )
}

fn spans(space: &AddressSpace) -> Vec<(u64, u64)> {
    space
        .regions()
        .map(|r| (r.start.as_u64(), r.end.as_u64()))
        .collect()
}

fn assert_sorted_disjoint(space: &AddressSpace) {
    let regions: Vec<&Region> = space.regions().collect();
    for pair in regions.windows(2) {
        assert!(pair[0].end <= pair[1].start, "regions overlap or are out of order");
    }
    for r in &regions {
        assert!(r.start < r.end);
        assert!(r.start.is_page_aligned() && r.end.is_page_aligned());
    }
}

#[test]
fn mmap_places_first_fit_and_merges_equal_neighbours() {
    let mut vm = space();
    let prot = Protection::read_write();

    let a = vm
        .mmap(VirtAddr::zero(), 2 * PAGE_SIZE, prot, RegionKind::Mapped, MapFlags::new())
        .unwrap();
    assert_eq!(a.as_u64(), FLOOR);

    let b = vm
        .mmap(VirtAddr::zero(), PAGE_SIZE, prot, RegionKind::Mapped, MapFlags::new())
        .unwrap();
    assert_eq!(b, a + 2 * PAGE_SIZE);

    // Same kind and protection, contiguous: one region.
    assert_eq!(spans(&vm), vec![(FLOOR, FLOOR + 3 * PAGE_SIZE)]);
    assert_sorted_disjoint(&vm);

    // Different protection must stay a separate region.
    let ro = Protection::new().with_read(true);
    vm.mmap(VirtAddr::zero(), PAGE_SIZE, ro, RegionKind::Mapped, MapFlags::new())
        .unwrap();
    assert_eq!(vm.regions().count(), 2);
    assert_sorted_disjoint(&vm);
}

#[test]
fn mmap_rounds_length_up_and_rejects_zero() {
    let mut vm = space();
    let prot = Protection::read_write();

    assert_eq!(
        vm.mmap(VirtAddr::zero(), 0, prot, RegionKind::Mapped, MapFlags::new()),
        Err(VmError::InvalidArgument)
    );

    let a = vm
        .mmap(VirtAddr::zero(), 1, prot, RegionKind::Mapped, MapFlags::new())
        .unwrap();
    let region = vm.regions().next().unwrap();
    assert_eq!(region.start, a);
    assert_eq!(region.len(), PAGE_SIZE);
}

#[test]
fn fixed_mapping_validates_address_and_collisions() {
    let mut vm = space();
    let prot = Protection::read_write();
    let fixed = MapFlags::new().with_fixed(true);

    let at = VirtAddr::new(0x5000);
    assert_eq!(vm.mmap(at, PAGE_SIZE, prot, RegionKind::Stack, fixed), Ok(at));

    // Overlapping fixed request fails without touching the region set.
    assert_eq!(
        vm.mmap(at, 2 * PAGE_SIZE, prot, RegionKind::Mapped, fixed),
        Err(VmError::AddressInUse)
    );
    assert_eq!(spans(&vm), vec![(0x5000, 0x6000)]);

    assert_eq!(
        vm.mmap(VirtAddr::new(0x5008), PAGE_SIZE, prot, RegionKind::Mapped, fixed),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        vm.mmap(VirtAddr::new(CEILING - PAGE_SIZE), 2 * PAGE_SIZE, prot, RegionKind::Mapped, fixed),
        Err(VmError::InvalidArgument)
    );
}

#[test]
fn first_fit_fills_the_gap_below_a_fixed_mapping() {
    let mut vm = space();
    let prot = Protection::read_write();
    let fixed = MapFlags::new().with_fixed(true);

    vm.mmap(VirtAddr::new(FLOOR + 2 * PAGE_SIZE), PAGE_SIZE, prot, RegionKind::Mapped, fixed)
        .unwrap();

    // Two pages fit exactly into [FLOOR, FLOOR + 2 pages).
    let a = vm
        .mmap(VirtAddr::zero(), 2 * PAGE_SIZE, prot, RegionKind::Stack, MapFlags::new())
        .unwrap();
    assert_eq!(a.as_u64(), FLOOR);

    // Three pages do not; they land above the fixed mapping.
    let b = vm
        .mmap(VirtAddr::zero(), 3 * PAGE_SIZE, prot, RegionKind::Stack, MapFlags::new())
        .unwrap();
    assert_eq!(b.as_u64(), FLOOR + 3 * PAGE_SIZE);
    assert_sorted_disjoint(&vm);
}

#[test]
fn munmap_interior_splits_and_returns_frames() {
    let mut vm = space();
    let mut pt = MockTables::default();
    let mut frames = MockFrames::with_budget(16);
    let prot = Protection::read_write();
    let fixed = MapFlags::new().with_fixed(true);

    let base = VirtAddr::new(0x8000);
    vm.mmap(base, 4 * PAGE_SIZE, prot, RegionKind::Mapped, fixed).unwrap();
    for i in 0..4 {
        let verdict = vm.handle_fault(&mut pt, &mut frames, base + i * PAGE_SIZE, Access::Write);
        assert_eq!(verdict, FaultVerdict::Handled);
    }
    assert_eq!(frames.outstanding, 4);

    vm.munmap(&mut pt, &mut frames, base + PAGE_SIZE, 2 * PAGE_SIZE).unwrap();

    assert_eq!(spans(&vm), vec![(0x8000, 0x9000), (0xB000, 0xC000)]);
    assert_eq!(frames.outstanding, 2);
    assert!(pt.translate(base).is_some());
    assert!(pt.translate(base + PAGE_SIZE).is_none());
    assert!(pt.translate(base + 2 * PAGE_SIZE).is_none());
    assert!(pt.translate(base + 3 * PAGE_SIZE).is_some());
    assert!(pt.flushes >= 2);
}

#[test]
fn munmap_rejects_ranges_outside_a_single_region() {
    let mut vm = space();
    let mut pt = MockTables::default();
    let mut frames = MockFrames::with_budget(4);
    let prot = Protection::read_write();
    let fixed = MapFlags::new().with_fixed(true);

    let base = VirtAddr::new(0x8000);
    vm.mmap(base, 2 * PAGE_SIZE, prot, RegionKind::Mapped, fixed).unwrap();

    // Straddles the region end.
    assert_eq!(
        vm.munmap(&mut pt, &mut frames, base + PAGE_SIZE, 2 * PAGE_SIZE),
        Err(VmError::PartialOverlap)
    );
    // Starts below the region.
    assert_eq!(
        vm.munmap(&mut pt, &mut frames, VirtAddr::new(0x7000), 2 * PAGE_SIZE),
        Err(VmError::PartialOverlap)
    );
    // Entirely unmapped space.
    assert_eq!(
        vm.munmap(&mut pt, &mut frames, VirtAddr::new(0x20000), PAGE_SIZE),
        Err(VmError::PartialOverlap)
    );
    // Bad arguments.
    assert_eq!(
        vm.munmap(&mut pt, &mut frames, base + 8, PAGE_SIZE),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(vm.munmap(&mut pt, &mut frames, base, 0), Err(VmError::InvalidArgument));

    // Nothing changed.
    assert_eq!(spans(&vm), vec![(0x8000, 0xA000)]);
}

#[test]
fn break_walkthrough_grows_shrinks_and_empties_the_heap() {
    let mut vm = space();
    let mut pt = MockTables::default();
    let mut frames = MockFrames::with_budget(16);

    assert_eq!(vm.heap_break().as_u64(), HEAP_START);

    let b = vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x12000));
    assert_eq!(b.as_u64(), 0x12000);
    assert_eq!(spans(&vm), vec![(0x10000, 0x12000)]);
    assert_eq!(vm.regions().next().unwrap().kind, RegionKind::Heap);

    // Touch the page that is about to be vacated, so shrinking has a frame
    // to give back.
    let verdict = vm.handle_fault(&mut pt, &mut frames, VirtAddr::new(0x11100), Access::Write);
    assert_eq!(verdict, FaultVerdict::Handled);
    assert_eq!(frames.outstanding, 1);

    let b = vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x11000));
    assert_eq!(b.as_u64(), 0x11000);
    assert_eq!(spans(&vm), vec![(0x10000, 0x11000)]);
    assert_eq!(frames.outstanding, 0);

    let b = vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x10000));
    assert_eq!(b.as_u64(), 0x10000);
    assert_eq!(vm.regions().count(), 0);
}

#[test]
fn break_tracks_bytes_within_a_page() {
    let mut vm = space();
    let mut pt = MockTables::default();
    let mut frames = MockFrames::with_budget(4);

    let b = vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x10004));
    assert_eq!(b.as_u64(), 0x10004);
    assert_eq!(spans(&vm), vec![(0x10000, 0x11000)]);

    // Same page: bookkeeping only, the region is untouched.
    let b = vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x10ABC));
    assert_eq!(b.as_u64(), 0x10ABC);
    assert_eq!(spans(&vm), vec![(0x10000, 0x11000)]);
}

#[test]
fn repeating_a_break_move_changes_nothing() {
    let mut vm = space();
    let mut pt = MockTables::default();
    let mut frames = MockFrames::with_budget(4);

    vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x13000));
    let before = spans(&vm);

    let b = vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x13000));
    assert_eq!(b.as_u64(), 0x13000);
    assert_eq!(spans(&vm), before);
    assert_eq!(vm.regions().count(), 1);
}

#[test]
fn break_rejections_leave_the_old_break_in_place() {
    let mut vm = space();
    let mut pt = MockTables::default();
    let mut frames = MockFrames::with_budget(4);

    vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x11000));

    // Below the heap bottom.
    let b = vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x8000));
    assert_eq!(b.as_u64(), 0x11000);

    // Past the heap ceiling.
    let b = vm.set_break(&mut pt, &mut frames, VirtAddr::new(HEAP_CEILING + 1));
    assert_eq!(b.as_u64(), 0x11000);

    // Into a foreign mapping.
    let fixed = MapFlags::new().with_fixed(true);
    vm.mmap(
        VirtAddr::new(0x12000),
        PAGE_SIZE,
        Protection::read_write(),
        RegionKind::Mapped,
        fixed,
    )
    .unwrap();
    let b = vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x13000));
    assert_eq!(b.as_u64(), 0x11000);

    // Growth up to (but not into) the foreign mapping still works, and the
    // differing kinds keep the regions separate.
    let b = vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x12000));
    assert_eq!(b.as_u64(), 0x12000);
    assert_eq!(spans(&vm), vec![(0x10000, 0x12000), (0x12000, 0x13000)]);
    assert_eq!(vm.regions().count(), 2);
}

#[test]
fn fault_binds_once_and_respects_protection() {
    let mut vm = space();
    let mut pt = MockTables::default();
    let mut frames = MockFrames::with_budget(4);
    let fixed = MapFlags::new().with_fixed(true);

    let ro = Protection::new().with_read(true);
    let base = VirtAddr::new(0x8000);
    vm.mmap(base, PAGE_SIZE, ro, RegionKind::Resource, fixed).unwrap();

    assert_eq!(
        vm.handle_fault(&mut pt, &mut frames, base + 0x10, Access::Read),
        FaultVerdict::Handled
    );
    assert_eq!(frames.outstanding, 1);

    // Second fault on the same page is spurious; no extra frame.
    assert_eq!(
        vm.handle_fault(&mut pt, &mut frames, base + 0x800, Access::Read),
        FaultVerdict::Handled
    );
    assert_eq!(frames.outstanding, 1);

    // Writes violate the region protection.
    assert_eq!(
        vm.handle_fault(&mut pt, &mut frames, base, Access::Write),
        FaultVerdict::Fatal
    );

    // Outside every region.
    assert_eq!(
        vm.handle_fault(&mut pt, &mut frames, VirtAddr::new(0x40000), Access::Read),
        FaultVerdict::Fatal
    );
}

#[test]
fn fault_without_frames_is_fatal_and_leaks_nothing() {
    let mut vm = space();
    let mut pt = MockTables::default();
    let mut frames = MockFrames::with_budget(0);
    let fixed = MapFlags::new().with_fixed(true);

    let base = VirtAddr::new(0x8000);
    vm.mmap(base, PAGE_SIZE, Protection::read_write(), RegionKind::Mapped, fixed)
        .unwrap();
    assert_eq!(
        vm.handle_fault(&mut pt, &mut frames, base, Access::Write),
        FaultVerdict::Fatal
    );
    assert_eq!(frames.outstanding, 0);
    assert!(pt.translate(base).is_none());
}

#[test]
fn release_all_empties_the_space_and_returns_every_frame() {
    let mut vm = space();
    let mut pt = MockTables::default();
    let mut frames = MockFrames::with_budget(16);
    let prot = Protection::read_write();

    vm.set_break(&mut pt, &mut frames, VirtAddr::new(0x12000));
    let a = vm
        .mmap(VirtAddr::zero(), 3 * PAGE_SIZE, prot, RegionKind::Mapped, MapFlags::new())
        .unwrap();
    for i in 0..3 {
        vm.handle_fault(&mut pt, &mut frames, a + i * PAGE_SIZE, Access::Write);
    }
    vm.handle_fault(&mut pt, &mut frames, VirtAddr::new(0x10000), Access::Write);
    assert_eq!(frames.outstanding, 4);

    vm.release_all(&mut pt, &mut frames);

    assert_eq!(vm.regions().count(), 0);
    assert_eq!(frames.outstanding, 0);
    assert!(pt.bound.is_empty());
    assert_eq!(vm.heap_break().as_u64(), HEAP_START);
}

#[test]
fn mixed_operation_sequences_keep_regions_sorted() {
    let mut vm = space();
    let mut pt = MockTables::default();
    let mut frames = MockFrames::with_budget(256);
    let prot = Protection::read_write();
    let fixed = MapFlags::new().with_fixed(true);

    // Fixed mappings and unmaps stay in a window well above the heap
    // ceiling so the break's backing region is never cut away externally.
    const WINDOW: u64 = 0x0010_0000;

    // xorshift64; the fixed seed keeps the interleaving reproducible.
    let mut state = 0x9E37_79B9_97F4_A7C5_u64;
    let mut rand = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    for _ in 0..96 {
        let len = (rand() % 4 + 1) * PAGE_SIZE;
        match rand() % 5 {
            0 => {
                let _ = vm.mmap(VirtAddr::zero(), len, prot, RegionKind::Mapped, MapFlags::new());
            }
            1 => {
                let at = VirtAddr::new(WINDOW + (rand() % 64) * PAGE_SIZE);
                let _ = vm.mmap(at, len, prot, RegionKind::Mapped, fixed);
            }
            2 => {
                let at = VirtAddr::new(WINDOW + (rand() % 64) * PAGE_SIZE);
                let _ = vm.munmap(&mut pt, &mut frames, at, len);
            }
            3 => {
                vm.set_break(&mut pt, &mut frames, VirtAddr::new(HEAP_START + rand() % 0x8000));
            }
            _ => {
                let targets = spans(&vm);
                if !targets.is_empty() {
                    let pick = usize::try_from(rand() % targets.len() as u64).unwrap();
                    let (start, end) = targets[pick];
                    let page = start + rand() % ((end - start) / PAGE_SIZE) * PAGE_SIZE;
                    vm.handle_fault(&mut pt, &mut frames, VirtAddr::new(page), Access::Write);
                }
            }
        }
        assert_sorted_disjoint(&vm);
        for r in vm.regions() {
            assert!(r.start.as_u64() >= FLOOR && r.end.as_u64() <= CEILING);
        }
    }

    vm.release_all(&mut pt, &mut frames);
    assert_eq!(vm.regions().count(), 0);
    assert_eq!(frames.outstanding, 0);
    assert!(pt.bound.is_empty());
}
