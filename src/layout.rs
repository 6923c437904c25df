//! Translation between heap offsets and blocks.
//!
//! A heap of `N` size classes spans `LEAF_SIZE * 2^(N-1)` bytes. Class `k`
//! tiles it with `2^(N-1-k)` blocks of `LEAF_SIZE * 2^k` bytes. Every function
//! here is pure and works on byte offsets from the heap base, so the
//! arithmetic can be checked without touching memory.

use crate::polyfill::UsizeExt;

/// A block, identified by its size class and its index within that class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef {
    /// The size class. Blocks of class `k` are `LEAF_SIZE * 2^k` bytes.
    pub class: usize,
    /// The index of the block within its class, counting from the heap base.
    pub index: usize,
}

impl BlockRef {
    /// Creates a new `BlockRef`.
    #[inline]
    pub const fn new(class: usize, index: usize) -> BlockRef {
        BlockRef { class, index }
    }

    /// Returns the sibling that shares this block's parent.
    #[inline]
    pub const fn buddy(self) -> BlockRef {
        BlockRef::new(self.class, self.index ^ 1)
    }

    /// Returns the index of this block's bit in its class's pair bitmap.
    #[inline]
    pub const fn pair(self) -> usize {
        self.index / 2
    }

    /// Returns the block one class up that contains this block.
    #[inline]
    pub const fn parent(self) -> BlockRef {
        BlockRef::new(self.class + 1, self.index / 2)
    }

    /// Returns `true` if this is the lower-addressed block of its pair.
    #[inline]
    pub const fn is_lower(self) -> bool {
        self.index % 2 == 0
    }
}

/// The shape of a heap: its leaf size and number of size classes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry<const LEAF_SIZE: usize> {
    num_classes: usize,
}

impl<const LEAF_SIZE: usize> Geometry<LEAF_SIZE> {
    /// Returns the geometry of the smallest heap covering `len` bytes.
    ///
    /// Returns `None` if `len` is smaller than one leaf or the rounded-up
    /// heap size does not fit in a `usize`.
    pub fn covering(len: usize) -> Option<Geometry<LEAF_SIZE>> {
        let leaves = len / LEAF_SIZE;
        if leaves == 0 {
            return None;
        }

        let mut num_classes = leaves.log2() as usize + 1;

        let geom = Self { num_classes };
        if len > geom.checked_heap_size()? {
            // Round up to the next power of two.
            num_classes += 1;
        }

        let geom = Self { num_classes };
        geom.checked_heap_size()?;

        Some(geom)
    }

    fn checked_heap_size(self) -> Option<usize> {
        let shift = u32::try_from(self.num_classes - 1).ok()?;

        LEAF_SIZE.checked_mul(1_usize.checked_shl(shift)?)
    }

    /// Returns the number of size classes, `N`.
    #[inline]
    pub fn num_classes(self) -> usize {
        self.num_classes
    }

    /// Returns the largest size class, `N - 1`.
    #[inline]
    pub fn max_class(self) -> usize {
        self.num_classes - 1
    }

    /// Returns the size in bytes of the whole heap.
    #[inline]
    pub fn heap_size(self) -> usize {
        self.block_size(self.max_class())
    }

    /// Returns the size in bytes of blocks of class `class`.
    #[inline]
    pub fn block_size(self, class: usize) -> usize {
        debug_assert!(class < self.num_classes);

        LEAF_SIZE << class
    }

    /// Returns the number of blocks tiling the heap at class `class`.
    #[inline]
    pub fn num_blocks(self, class: usize) -> usize {
        debug_assert!(class < self.num_classes);

        1 << (self.max_class() - class)
    }

    /// Returns the class-`class` block that contains byte `offset`.
    #[inline]
    pub fn block_of(self, class: usize, offset: usize) -> BlockRef {
        BlockRef::new(class, offset / self.block_size(class))
    }

    /// Returns the index of the first class-`class` block that starts at or
    /// after `offset`.
    #[inline]
    pub fn ceil_block_index(self, class: usize, offset: usize) -> usize {
        offset.div_ceil(self.block_size(class))
    }

    /// Returns the offset of the first byte of `block`.
    #[inline]
    pub fn offset_of(self, block: BlockRef) -> usize {
        block.index * self.block_size(block.class)
    }

    /// Returns the smallest class whose blocks hold at least `nbytes` bytes.
    ///
    /// The result may exceed [`max_class`](Self::max_class), meaning no block
    /// in this heap is large enough. Requests too large to represent yield
    /// `usize::BITS`, which exceeds the class count of every heap.
    pub fn first_class_for(nbytes: usize) -> usize {
        let mut class = 0;
        let mut size = LEAF_SIZE;

        while size < nbytes {
            size = match size.checked_mul(2) {
                Some(s) => s,
                None => return usize::BITS as usize,
            };
            class += 1;
        }

        class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type G = Geometry<16>;

    #[test]
    fn covering_exact_power_of_two() {
        let g = G::covering(1024).unwrap();
        assert_eq!(g.num_classes(), 7);
        assert_eq!(g.heap_size(), 1024);
        assert_eq!(g.block_size(0), 16);
        assert_eq!(g.block_size(6), 1024);
        assert_eq!(g.num_blocks(0), 64);
        assert_eq!(g.num_blocks(6), 1);
    }

    #[test]
    fn covering_rounds_up() {
        let g = G::covering(1025).unwrap();
        assert_eq!(g.heap_size(), 2048);

        let g = G::covering(1000).unwrap();
        assert_eq!(g.heap_size(), 1024);

        let g = G::covering(16).unwrap();
        assert_eq!(g.num_classes(), 1);
        assert_eq!(g.heap_size(), 16);
    }

    #[test]
    fn covering_rejects_tiny_and_huge() {
        assert_eq!(G::covering(0), None);
        assert_eq!(G::covering(15), None);
        assert_eq!(G::covering(usize::MAX), None);
    }

    #[test]
    fn first_class_for_doubles_from_leaf() {
        assert_eq!(G::first_class_for(0), 0);
        assert_eq!(G::first_class_for(1), 0);
        assert_eq!(G::first_class_for(16), 0);
        assert_eq!(G::first_class_for(17), 1);
        assert_eq!(G::first_class_for(20), 1);
        assert_eq!(G::first_class_for(32), 1);
        assert_eq!(G::first_class_for(1000), 6);
        assert_eq!(G::first_class_for(usize::MAX), usize::BITS as usize);
    }

    #[test]
    fn index_and_offset_translate() {
        let g = G::covering(1024).unwrap();

        let b = g.block_of(2, 200);
        assert_eq!(b, BlockRef::new(2, 3));
        assert_eq!(g.offset_of(b), 192);

        assert_eq!(g.ceil_block_index(2, 192), 3);
        assert_eq!(g.ceil_block_index(2, 193), 4);
        assert_eq!(g.ceil_block_index(0, 0), 0);
    }

    #[test]
    fn block_relations() {
        let b = BlockRef::new(3, 5);
        assert_eq!(b.buddy(), BlockRef::new(3, 4));
        assert_eq!(b.buddy().buddy(), b);
        assert_eq!(b.pair(), 2);
        assert_eq!(b.buddy().pair(), 2);
        assert_eq!(b.parent(), BlockRef::new(4, 2));
        assert!(!b.is_lower());
        assert!(b.buddy().is_lower());
    }
}
