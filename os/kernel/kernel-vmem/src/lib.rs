//! Per-task virtual address spaces.
//!
//! An [`AddressSpace`] tracks the mapped regions of one task as a sorted,
//! non-overlapping set keyed by start address. Pages are bound lazily: mapping
//! a region only records bookkeeping, and the page-fault path binds physical
//! frames on first access. Hardware page tables and physical frames sit behind
//! the [`PageTables`] and [`FrameAlloc`] traits so the core logic stays
//! independent of the paging implementation.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod address_space;
mod region;

pub use address_space::{AddressSpace, AddressSpaceLayout};
pub use region::{Access, MapFlags, Protection, Region, RegionKind};

use kernel_addresses::{PhysAddr, VirtAddr};

/// Errors surfaced by address space operations.
///
/// All of these are recoverable from the caller's point of view: a failed
/// system call returns the error to the task and the address space is left
/// unchanged (no region is partially inserted or partially removed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// No free address range (or no physical frame) large enough.
    #[error("out of memory")]
    OutOfMemory,

    /// A length, alignment or address argument is unusable.
    #[error("invalid argument")]
    InvalidArgument,

    /// A fixed-address mapping collides with an existing region.
    #[error("address range already in use")]
    AddressInUse,

    /// An unmap request straddles a region boundary or unmapped space.
    #[error("range partially overlaps the tracked regions")]
    PartialOverlap,
}

/// Outcome of a page fault, as seen by the trap handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultVerdict {
    /// A frame was bound (or was already present); retry the access.
    Handled,

    /// The access is invalid or unservable; deliver a fatal fault to the task.
    Fatal,
}

/// Hardware page table mutations needed by the address space core.
///
/// Implementations translate between page-aligned virtual addresses and
/// physical frames; TLB maintenance is explicit via [`invalidate`].
///
/// [`invalidate`]: PageTables::invalidate
pub trait PageTables {
    /// Binds `pa` at the page containing `va` with the given protection.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::OutOfMemory`] if an intermediate table cannot be
    /// allocated.
    fn map_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        prot: Protection,
    ) -> Result<(), VmError>;

    /// Removes the binding for the page containing `va`, returning the frame
    /// that was mapped there, if any.
    fn unmap_page(&mut self, va: VirtAddr) -> Option<PhysAddr>;

    /// Looks up the frame currently bound at `va` without changing anything.
    fn translate(&self, va: VirtAddr) -> Option<PhysAddr>;

    /// Flushes any cached translation for the page containing `va`.
    fn invalidate(&mut self, va: VirtAddr);
}

/// Source of physical frames for demand paging.
pub trait FrameAlloc {
    /// Hands out one zeroed page-sized frame, or `None` when exhausted.
    fn alloc_frame(&mut self) -> Option<PhysAddr>;

    /// Returns a frame previously obtained from [`alloc_frame`].
    ///
    /// [`alloc_frame`]: FrameAlloc::alloc_frame
    fn free_frame(&mut self, pa: PhysAddr);
}
