//! # Physical memory manager
//!
//! Splits physical memory into zones at boot and serves page-granular
//! allocations from a per-zone buddy system:
//!
//! - [`boot`] — the bump allocator that carves each zone's bookkeeping
//!   (descriptor array, per-order bitmaps) out of the zone's own prefix.
//! - [`page`] — one [`PageDescriptor`](page::PageDescriptor) per physical
//!   frame, with a tagged [`PageOwner`](page::PageOwner) so exactly one
//!   interpretation of a page is live at a time.
//! - [`zone`] — zone sizing and the phys↔descriptor lookups, all failing
//!   closed outside configured ranges.
//! - buddy allocate/free over one zone: split on allocate, XOR-buddy
//!   coalesce on free, both `O(MAX_ORDER)`.
//!
//! Zones and their bitmaps are created once at boot and never destroyed.
//! Callers serialize access by masking interrupts (`kernel-sync`); nothing in
//! this crate blocks.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

pub mod boot;
mod buddy;
pub mod page;
pub mod zone;

pub use page::{PageDescriptor, PageOwner};
pub use zone::{BootInfo, PageRef, Zone, ZoneId, ZoneStats, ZoneTable};

use kernel_addresses::PhysAddr;

/// Highest supported allocation order, exclusive: valid orders are
/// `0..MAX_ORDER`, the largest block covers `2^(MAX_ORDER-1)` pages (4 MiB).
pub const MAX_ORDER: u8 = 11;

/// Recoverable physical-allocation failures.
///
/// Inconsistent allocator state is never reported through this type; it
/// halts the kernel instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmmError {
    /// No free block of the requested order anywhere in the targeted zone.
    #[error("zone {zone:?}: no free block of order {order}")]
    OutOfMemory {
        /// The zone that was searched.
        zone: ZoneId,
        /// The requested order.
        order: u8,
    },
    /// Requested order is outside `0..MAX_ORDER`.
    #[error("order {0} is outside the supported range")]
    InvalidOrder(u8),
    /// The address does not belong to any configured zone.
    #[error("address {0} is outside every configured zone")]
    UnknownAddress(PhysAddr),
    /// The block's page index is not aligned for its claimed order.
    #[error("page index {index} is misaligned for order {order}")]
    MisalignedBlock {
        /// First page index of the block.
        index: u32,
        /// The claimed order.
        order: u8,
    },
}

/// Halt on an inconsistent allocator structure.
///
/// Continuing with a corrupt bitmap or ownership tag risks handing out
/// memory that is already owned, so this never returns to the caller.
#[cold]
pub(crate) fn corrupt_state(what: &str) -> ! {
    log::error!("memory corruption: {what}");
    panic!("memory corruption: {what}");
}
