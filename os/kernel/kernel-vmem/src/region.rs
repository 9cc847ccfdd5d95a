//! Region bookkeeping types.

use bitfield_struct::bitfield;
use kernel_addresses::VirtAddr;

/// Page protection bits for a region.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Protection {
    /// Loads from the region are permitted.
    pub read: bool,

    /// Stores to the region are permitted.
    pub write: bool,

    /// Instruction fetch from the region is permitted.
    pub execute: bool,

    #[bits(5)]
    __: u8,
}

impl Protection {
    /// Read/write data, the protection used for heap and stack pages.
    #[must_use]
    pub const fn read_write() -> Self {
        Self::new().with_read(true).with_write(true)
    }

    /// Whether this protection allows the given kind of access.
    #[must_use]
    pub const fn allows(self, access: Access) -> bool {
        match access {
            Access::Read => self.read(),
            Access::Write => self.write(),
            Access::Execute => self.execute(),
        }
    }
}

/// Flags modifying mapping requests.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct MapFlags {
    /// Map at exactly the requested address instead of searching for a gap.
    pub fixed: bool,

    #[bits(7)]
    __: u8,
}

/// What a region of address space is used for.
///
/// Adjacent regions only merge when their kinds match, so a heap region never
/// silently absorbs a neighbouring mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// The task heap, managed through `set_break`.
    Heap,

    /// A task stack.
    Stack,

    /// An anonymous demand-paged mapping.
    Mapped,

    /// A mapping backed by a kernel-managed resource.
    Resource,
}

/// The kind of memory access that raised a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// One contiguous span of mapped address space.
///
/// `start` and `end` are page aligned and `start < end` always holds; empty
/// regions are removed rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First address covered, inclusive.
    pub start: VirtAddr,

    /// First address past the region, exclusive.
    pub end: VirtAddr,

    /// Protection applied to every page of the region.
    pub prot: Protection,

    /// Purpose of the region.
    pub kind: RegionKind,
}

impl Region {
    /// Number of bytes spanned.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Regions are never empty; this exists to satisfy the usual pairing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `va` falls inside the region.
    #[must_use]
    pub fn contains(&self, va: VirtAddr) -> bool {
        self.start <= va && va < self.end
    }
}
