//! Size classes and group geometry.

use crate::CacheError;
use core::mem::size_of;
use kernel_addresses::PAGE_SIZE;
use kernel_bitvec::words_for;
use kernel_pmm::MAX_ORDER;

/// Object sizes served by the cache table, ascending powers of two from
/// 32 B to 1 MiB. Larger requests are rejected with
/// [`CacheError::BadSize`].
pub const CLASS_SIZES: [usize; 16] = {
    let mut sizes = [0usize; 16];
    let mut i = 0;
    while i < sizes.len() {
        sizes[i] = 32 << i;
        i += 1;
    }
    sizes
};

/// Number of configured size classes.
pub const CLASS_COUNT: usize = CLASS_SIZES.len();

/// A group should hold at least this many objects when the class size
/// allows it within the largest buddy block.
const MIN_OBJECTS: u32 = 4;

/// Smallest class index whose object size is at least `size`.
pub(crate) fn class_for(size: usize) -> Result<u8, CacheError> {
    match CLASS_SIZES.iter().position(|&s| s >= size) {
        Some(class) => Ok(class as u8),
        None => Err(CacheError::BadSize(size)),
    }
}

/// Precomputed layout of one group of a size class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct GroupGeometry {
    /// Buddy order of the backing block.
    pub order: u8,
    /// Object slots per group.
    pub capacity: u32,
    /// Byte offset of slot 0 from the group base (past header and bitmap).
    pub first_object: u32,
}

/// Fit `capacity` objects plus in-band bookkeeping into one `2^order`-page
/// block, or `None` if not even one object fits.
fn geometry_at(object_size: usize, order: u8, header_bytes: usize) -> Option<GroupGeometry> {
    let backing = (PAGE_SIZE as usize) << order;
    let slot_align = object_size.min(PAGE_SIZE as usize);
    let mut capacity = backing / object_size;
    while capacity > 0 {
        let bitmap_bytes = words_for(capacity) * size_of::<u64>();
        let first_object = kernel_addresses::align_up((header_bytes + bitmap_bytes) as u64, slot_align as u64) as usize;
        if first_object + capacity * object_size <= backing {
            return Some(GroupGeometry {
                order,
                capacity: capacity as u32,
                first_object: first_object as u32,
            });
        }
        capacity -= 1;
    }
    None
}

/// Choose a group layout for a class: the smallest backing order reaching
/// [`MIN_OBJECTS`], falling back to the smallest order fitting one object.
///
/// # Panics
/// If the class cannot fit a single object in the largest buddy block; the
/// class table is a compile-time constant, so this is a configuration bug
/// caught at boot.
pub(crate) fn geometry_for(object_size: usize, header_bytes: usize) -> GroupGeometry {
    let mut fallback = None;
    for order in 0..MAX_ORDER {
        if let Some(geometry) = geometry_at(object_size, order, header_bytes) {
            if geometry.capacity >= MIN_OBJECTS {
                return geometry;
            }
            if fallback.is_none() {
                fallback = Some(geometry);
            }
        }
    }
    fallback.unwrap_or_else(|| panic!("size class {object_size} exceeds the largest buddy block"))
}
