//! In-band group ("slab") headers.
//!
//! A group's backing block is laid out as:
//!
//! ```text
//! +--------------+------------------+----------------------------+
//! | GroupHeader  | slot bitmap      | objects (capacity * size)  |
//! +--------------+------------------+----------------------------+
//! ^ group base   ^ 8-aligned        ^ first_object (slot-aligned)
//! ```
//!
//! The header is written into the block itself when the group is created
//! and is only ever accessed through raw pointers while the cache table is
//! locked.

use crate::classes::GroupGeometry;
use core::mem::size_of;
use core::ptr::{self, null_mut};
use kernel_addresses::{PhysAddr, VirtAddr};
use kernel_bitvec::{BitVec, words_for};

/// Bookkeeping at the head of every group's backing block.
///
/// `used + free slots == capacity` at all times; the cache moves the group
/// between its `full`/`partial`/`free` lists exactly when `used` crosses
/// `capacity` or zero.
#[repr(C)]
pub(crate) struct GroupHeader {
    /// Intrusive links of the cache list currently holding this group.
    pub next: *mut GroupHeader,
    pub prev: *mut GroupHeader,
    /// Physical base of the backing block.
    pub phys: PhysAddr,
    /// Object size of the owning class.
    pub object_size: u32,
    /// Total slots in this group.
    pub capacity: u32,
    /// Byte offset of slot 0 from the header.
    pub first_object: u32,
    /// Currently allocated slots.
    pub used: u32,
    /// Owning class index.
    pub class: u8,
    /// Buddy order of the backing block.
    pub order: u8,
}

impl GroupHeader {
    /// Write a fresh header (and an all-free bitmap) at `base`.
    ///
    /// # Safety
    /// `base` must point to the start of a writable, exclusively owned
    /// `2^geometry.order`-page block whose physical base is `phys`.
    pub unsafe fn init(
        base: VirtAddr,
        class: u8,
        object_size: u32,
        geometry: GroupGeometry,
        phys: PhysAddr,
    ) -> *mut Self {
        let header = base.as_mut_ptr::<Self>();
        // SAFETY: the block is writable and exclusive per our contract;
        // the bitmap words directly follow the 8-aligned header.
        unsafe {
            header.write(Self {
                next: null_mut(),
                prev: null_mut(),
                phys,
                object_size,
                capacity: geometry.capacity,
                first_object: geometry.first_object,
                used: 0,
                class,
                order: geometry.order,
            });
            ptr::write_bytes(
                Self::bitmap_base(header),
                0,
                words_for(geometry.capacity as usize),
            );
        }
        header
    }

    const fn bitmap_base(header: *mut Self) -> *mut u64 {
        // The header size is a multiple of 8, so the words are aligned.
        unsafe { header.add(1).cast::<u64>() }
    }

    /// The slot-occupancy bitmap (bit set = slot in use).
    pub fn slots(&mut self) -> BitVec<'_> {
        let words = words_for(self.capacity as usize);
        // SAFETY: the words were reserved and zeroed by `init` and are
        // covered by the same exclusive borrow as `self`.
        let words = unsafe { core::slice::from_raw_parts_mut(Self::bitmap_base(self), words) };
        BitVec::new(words, self.capacity as usize)
    }

    /// Virtual address of `slot`.
    pub fn object_at(&self, slot: usize) -> VirtAddr {
        debug_assert!(slot < self.capacity as usize);
        VirtAddr::from_ptr(ptr::from_ref(self))
            + u64::from(self.first_object)
            + slot as u64 * u64::from(self.object_size)
    }

    /// Slot index of an object pointer, or `None` when the pointer does not
    /// address the start of a slot in this group.
    pub fn slot_of(&self, object: VirtAddr) -> Option<usize> {
        let base = VirtAddr::from_ptr(ptr::from_ref(self)) + u64::from(self.first_object);
        if object < base {
            return None;
        }
        let offset = object - base;
        let slot = offset / u64::from(self.object_size);
        if offset % u64::from(self.object_size) == 0 && slot < u64::from(self.capacity) {
            Some(slot as usize)
        } else {
            None
        }
    }
}

const _: () = assert!(size_of::<GroupHeader>() % 8 == 0);

/// An intrusive doubly linked list of groups.
pub(crate) struct GroupList {
    pub head: *mut GroupHeader,
    pub len: u32,
}

impl GroupList {
    pub const fn new() -> Self {
        Self {
            head: null_mut(),
            len: 0,
        }
    }

    /// Push `group` at the front.
    ///
    /// # Safety
    /// `group` must be a live header not currently on any list.
    pub unsafe fn push(&mut self, group: *mut GroupHeader) {
        // SAFETY: `group` is live and unlinked per our contract.
        unsafe {
            (*group).next = self.head;
            (*group).prev = null_mut();
            if !self.head.is_null() {
                (*self.head).prev = group;
            }
        }
        self.head = group;
        self.len += 1;
    }

    /// Unlink `group` from this list.
    ///
    /// # Safety
    /// `group` must currently be on this list.
    pub unsafe fn remove(&mut self, group: *mut GroupHeader) {
        // SAFETY: `group` is on this list per our contract, so its
        // neighbors are live headers of the same list.
        unsafe {
            let (prev, next) = ((*group).prev, (*group).next);
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*group).next = null_mut();
            (*group).prev = null_mut();
        }
        self.len -= 1;
    }

    /// Pop the front group, if any.
    pub fn pop(&mut self) -> Option<*mut GroupHeader> {
        let head = self.head;
        if head.is_null() {
            return None;
        }
        // SAFETY: a non-null head is on this list.
        unsafe { self.remove(head) };
        Some(head)
    }
}
