//! Page descriptors.
//!
//! One [`PageDescriptor`] exists per physical page frame, living in an arena
//! owned by the frame's zone. Free-list membership is intrusive via stable
//! arena indices (`next_free`/`prev_free`), never raw pointers.

use kernel_addresses::{PhysAddr, TaskId};

/// Sentinel for "no descriptor" in intrusive index links.
pub(crate) const NIL: u32 = u32::MAX;

/// The single live interpretation of a physical page.
///
/// A page is in exactly one of these states at all times; the enum replaces
/// the usual role-punning of descriptor fields so the compiler enforces the
/// discrimination.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageOwner {
    /// Interior page of a block; the block's head page carries the state.
    Tail,
    /// Head page of a free block linked into its order's free list.
    Free {
        /// Order of the free block this page heads.
        order: u8,
    },
    /// Head page of a block handed out whole by the buddy allocator.
    Allocated {
        /// Order the block was allocated at.
        order: u8,
    },
    /// Backing page of an object-cache group.
    Cache {
        /// Size-class index within the cache table.
        class: u8,
        /// Physical address of the group's first backing page.
        group: PhysAddr,
    },
    /// Page bound to a task's address-space mapping.
    Mapped {
        /// Owning task.
        task: TaskId,
    },
}

/// Bookkeeping for one physical page frame.
#[derive(Copy, Clone, Debug)]
pub struct PageDescriptor {
    /// Current ownership state.
    pub owner: PageOwner,
    /// Next free block at the same order; valid only when `owner` is `Free`.
    pub(crate) next_free: u32,
    /// Previous free block at the same order; valid only when `owner` is `Free`.
    pub(crate) prev_free: u32,
}

impl PageDescriptor {
    /// A descriptor for a page not yet entered into any free list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owner: PageOwner::Tail,
            next_free: NIL,
            prev_free: NIL,
        }
    }
}

impl Default for PageDescriptor {
    fn default() -> Self {
        Self::new()
    }
}
