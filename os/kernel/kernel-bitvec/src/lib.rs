//! # Fixed-capacity bit vectors
//!
//! A [`BitVec`] is a view over a caller-provided `u64` word slice, tracking
//! one bit per slot. It is the tracking structure shared by every allocator
//! layer: the buddy allocator keeps one per order (bit set = block not whole
//! on that order's free list), and the object cache keeps one per slab group
//! (bit set = slot in use).
//!
//! The storage is borrowed rather than owned so the same type works over
//! boot-time carved memory, in-band slab header words, and plain arrays in
//! tests.
//!
//! The buddy sibling arithmetic lives here too ([`buddy_index`]) so the
//! order-to-mask conversion is written and tested exactly once.

#![cfg_attr(not(any(test, doctest)), no_std)]

const WORD_BITS: usize = u64::BITS as usize;

/// Number of `u64` words required to back `bits` bits.
///
/// Used by boot code to size the per-order bitmap allocations.
#[inline]
#[must_use]
pub const fn words_for(bits: usize) -> usize {
    bits.div_ceil(WORD_BITS)
}

/// Index of the buddy of block `index` at `order`.
///
/// Blocks of order `k` are identified by their first page index; the buddy of
/// a block differs from it in exactly bit `k`. This holds whenever block
/// indices are multiples of the block span, which the zone layer guarantees
/// by indexing pages relative to the zone start.
#[inline]
#[must_use]
pub const fn buddy_index(index: usize, order: u8) -> usize {
    index ^ (1 << order)
}

/// A fixed-capacity bit array over borrowed word storage.
///
/// All indices are bounds-checked; out-of-range access panics, matching the
/// fail-fast policy for allocator-internal corruption.
pub struct BitVec<'a> {
    words: &'a mut [u64],
    bits: usize,
}

impl<'a> BitVec<'a> {
    /// Create a view of `bits` bits over `words`.
    ///
    /// # Panics
    /// If `words` is too short for `bits`.
    #[must_use]
    pub fn new(words: &'a mut [u64], bits: usize) -> Self {
        assert!(words.len() >= words_for(bits), "word slice too short");
        Self { words, bits }
    }

    /// Number of bits tracked.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bits
    }

    /// `true` if the vector tracks no bits.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Test bit `index`.
    #[inline]
    #[must_use]
    pub fn test(&self, index: usize) -> bool {
        assert!(index < self.bits, "bit index out of range");
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Set bit `index`.
    #[inline]
    pub fn set(&mut self, index: usize) {
        assert!(index < self.bits, "bit index out of range");
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
    }

    /// Clear bit `index`.
    #[inline]
    pub fn clear(&mut self, index: usize) {
        assert!(index < self.bits, "bit index out of range");
        self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
    }

    /// Set every bit.
    pub fn fill(&mut self) {
        for w in &mut *self.words {
            *w = u64::MAX;
        }
    }

    /// Clear every bit.
    pub fn clear_all(&mut self) {
        for w in &mut *self.words {
            *w = 0;
        }
    }

    /// Index of the first clear bit, scanning whole words at a time.
    #[must_use]
    pub fn first_clear(&self) -> Option<usize> {
        for (wi, &w) in self.words.iter().enumerate() {
            if w != u64::MAX {
                let bit = wi * WORD_BITS + (!w).trailing_zeros() as usize;
                if bit < self.bits {
                    return Some(bit);
                }
                // Padding bits past `self.bits` are don't-care.
                return None;
            }
        }
        None
    }

    /// Start index of the first run of `run` consecutive clear bits.
    #[must_use]
    pub fn first_clear_run(&self, run: usize) -> Option<usize> {
        if run == 0 || run > self.bits {
            return None;
        }
        let mut start = 0;
        let mut len = 0;
        for index in 0..self.bits {
            if self.test(index) {
                len = 0;
                start = index + 1;
            } else {
                len += 1;
                if len == run {
                    return Some(start);
                }
            }
        }
        None
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_set(&self) -> usize {
        let mut total: usize = 0;
        for index in 0..self.bits {
            total += usize::from(self.test(index));
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_test() {
        let mut words = [0u64; 2];
        let mut bv = BitVec::new(&mut words, 100);
        assert!(!bv.test(0));
        bv.set(0);
        bv.set(63);
        bv.set(64);
        bv.set(99);
        assert!(bv.test(0));
        assert!(bv.test(63));
        assert!(bv.test(64));
        assert!(bv.test(99));
        bv.clear(63);
        assert!(!bv.test(63));
        assert_eq!(bv.count_set(), 3);
    }

    #[test]
    fn first_clear_skips_full_words() {
        let mut words = [u64::MAX, u64::MAX, !(1 << 5)];
        let bv = BitVec::new(&mut words, 192);
        assert_eq!(bv.first_clear(), Some(133));
    }

    #[test]
    fn first_clear_ignores_padding() {
        // 10 tracked bits, all set; the untracked remainder of the word is
        // clear but must not be reported.
        let mut words = [0x3FFu64];
        let bv = BitVec::new(&mut words, 10);
        assert_eq!(bv.first_clear(), None);
    }

    #[test]
    fn first_clear_run_finds_gap() {
        let mut words = [0u64];
        let mut bv = BitVec::new(&mut words, 32);
        bv.fill_range_for_test(&[0, 1, 2, 5, 6, 10]);
        assert_eq!(bv.first_clear_run(3), Some(7));
        assert_eq!(bv.first_clear_run(1), Some(3));
        assert_eq!(bv.first_clear_run(21), Some(11));
        assert_eq!(bv.first_clear_run(22), None);
    }

    #[test]
    fn fill_and_clear_all() {
        let mut words = [0u64; 1];
        let mut bv = BitVec::new(&mut words, 40);
        bv.fill();
        assert_eq!(bv.first_clear(), None);
        bv.clear_all();
        assert_eq!(bv.first_clear(), Some(0));
        assert_eq!(bv.count_set(), 0);
    }

    #[test]
    fn words_for_rounds_up() {
        assert_eq!(words_for(0), 0);
        assert_eq!(words_for(1), 1);
        assert_eq!(words_for(64), 1);
        assert_eq!(words_for(65), 2);
        assert_eq!(words_for(128), 2);
    }

    #[test]
    fn buddy_index_at_every_order() {
        // Sibling pairs differ in exactly bit `order` and map to each other.
        for order in 0..11u8 {
            let block = 1usize << order;
            assert_eq!(buddy_index(0, order), block);
            assert_eq!(buddy_index(block, order), 0);
            // A block above the pair boundary pairs downward.
            let high = 3 << order;
            assert_eq!(buddy_index(high, order), 2 << order);
            // Involution.
            assert_eq!(buddy_index(buddy_index(high, order), order), high);
        }
    }

    #[test]
    fn buddy_index_preserves_alignment() {
        for order in 0..8u8 {
            let idx = 5usize << (order + 1);
            let b = buddy_index(idx, order);
            // The pair shares all bits above `order`.
            assert_eq!(idx >> (order + 1), b >> (order + 1));
            assert_ne!(idx, b);
        }
    }

    impl BitVec<'_> {
        fn fill_range_for_test(&mut self, bits: &[usize]) {
            for &b in bits {
                self.set(b);
            }
        }
    }
}
