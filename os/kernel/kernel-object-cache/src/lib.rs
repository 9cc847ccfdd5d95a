//! # Fixed-size object caches
//!
//! The kernel's general-purpose allocator: a fixed table of power-of-two
//! size classes, each backed by groups ("slabs") of same-sized object slots
//! carved out of buddy blocks from the dynamic zone.
//!
//! Group bookkeeping lives **in-band** at the head of each group's backing
//! pages (header, then the slot bitmap, then the object area), so creating a
//! group needs nothing but the buddy allocator — there is no
//! chicken-and-egg allocation for metadata. Every backing page's descriptor
//! is tagged with its `(class, group)` so `free` can resolve any object
//! pointer through the page arena.
//!
//! Groups migrate between three disjoint per-class lists as their occupancy
//! changes: `full` (no free slot), `partial`, and `free` (no used slot).
//! Fully free groups are returned to the buddy allocator only by an explicit
//! [`CacheTable::shrink`] call, never automatically.
//!
//! Callers serialize access by masking interrupts; nothing here blocks.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

mod cache;
mod classes;
mod group;

pub use cache::{CacheStats, CacheTable, ZoneTableExt, ZonesReady};
pub use classes::{CLASS_COUNT, CLASS_SIZES};

/// Recoverable object-allocation failures.
///
/// A corrupt or out-of-range ownership tag encountered during `free` is not
/// in this taxonomy: continuing would risk writing through a stale bitmap,
/// so it halts the kernel instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// No backing block obtainable for a new group.
    #[error("no object-cache group obtainable")]
    OutOfMemory,
    /// The request exceeds the largest configured size class.
    #[error("size {0} exceeds the largest size class")]
    BadSize(usize),
}
