//! Bump allocation for boot-time bookkeeping.
//!
//! Zone construction needs a descriptor array and one bitmap per order
//! before any allocator exists. A [`BootAllocator`] hands out permanent
//! slices from the zone's own memory prefix; whatever it consumed is
//! excised from the zone's free space when the free lists are seeded.
//! Nothing is ever returned to it.

use core::mem::{align_of, size_of};
use core::slice;
use kernel_addresses::VirtAddr;

/// A bump allocator over one contiguous, already-mapped memory range.
pub struct BootAllocator {
    base: u64,
    next: u64,
    end: u64,
}

impl BootAllocator {
    /// Manage `[base, base + size)`.
    ///
    /// # Safety
    /// The range must be mapped, writable, and exclusively owned by this
    /// allocator until zone construction completes.
    #[must_use]
    pub const unsafe fn new(base: VirtAddr, size: u64) -> Self {
        Self {
            base: base.as_u64(),
            next: base.as_u64(),
            end: base.as_u64() + size,
        }
    }

    /// Bytes handed out so far, including alignment padding.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> u64 {
        self.next - self.base
    }

    /// Carve a permanent slice of `count` elements, each set to `fill`.
    ///
    /// Returns `None` when the range is exhausted; boot code treats that as
    /// a fatal sizing failure.
    pub fn alloc_slice<T: Copy>(&mut self, count: usize, fill: T) -> Option<&'static mut [T]> {
        let align = align_of::<T>() as u64;
        let start = kernel_addresses::align_up(self.next, align);
        let bytes = (size_of::<T>() * count) as u64;
        if start.checked_add(bytes)? > self.end {
            return None;
        }
        self.next = start + bytes;

        let ptr = start as *mut T;
        // SAFETY: the range is mapped, writable, exclusive (constructor
        // contract), `ptr` is aligned, and the bump cursor guarantees the
        // slice never overlaps an earlier allocation.
        unsafe {
            for i in 0..count {
                ptr.add(i).write(fill);
            }
            Some(slice::from_raw_parts_mut(ptr, count))
        }
    }
}
