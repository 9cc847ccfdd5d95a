//! `GlobalAlloc` adapter over the object caches.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::api;
use kernel_addresses::PAGE_SIZE;

/// Routes the kernel's `alloc` crate usage into the object caches.
///
/// Size classes are powers of two starting at 32 bytes and every object is
/// aligned to its class size capped at a page (group bases are only
/// page-aligned), so requesting `max(size, align)` satisfies any layout
/// with `align <= PAGE_SIZE`. Oversized or over-aligned layouts yield null,
/// per the `GlobalAlloc` contract.
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAGE_SIZE as usize {
            return ptr::null_mut();
        }
        api::allocate_object(layout.size().max(layout.align()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        api::free_object(ptr);
    }
}

#[cfg(all(target_os = "none", not(test)))]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;
