//! Human-readable dump of an allocator's bookkeeping.

use core::fmt;

use crate::BuddyAllocator;

impl<const LEAF_SIZE: usize> BuddyAllocator<LEAF_SIZE> {
    /// Writes the state of every size class to `w`.
    ///
    /// For each class this prints the block size and count, the addresses on
    /// its free list, and the index ranges of set bits in its pair and split
    /// bitmaps. The output is for debugging only; its format is not stable.
    pub fn dump<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        let base = self.base_ptr();
        let geometry = self.geometry();

        writeln!(w, "=== buddy dump ===")?;

        for (k, class) in self.classes().iter().enumerate() {
            write!(
                w,
                "size {k} (blksz {} nblk {}): free list:",
                geometry.block_size(k),
                geometry.num_blocks(k)
            )?;

            // SAFETY: every member was pushed with `base`, and `&self`
            // prevents modification while iterating.
            for addr in unsafe { class.free.iter(base) } {
                write!(w, " {addr:#x}")?;
            }
            writeln!(w)?;

            write!(w, "  alloc:")?;
            for r in class.pairs.bits().set_ranges() {
                write!(w, " [{}, {})", r.start, r.end)?;
            }
            writeln!(w)?;

            if let Some(splits) = class.splits.as_ref() {
                write!(w, "  split:")?;
                for r in splits.set_ranges() {
                    write!(w, " [{}, {})", r.start, r.end)?;
                }
                writeln!(w)?;
            }
        }

        Ok(())
    }

    /// Returns an adaptor that formats the allocator with [`dump`](Self::dump).
    pub fn display(&self) -> Dump<'_, LEAF_SIZE> {
        Dump { buddy: self }
    }
}

/// Displays the bookkeeping of a [`BuddyAllocator`].
///
/// Returned by [`BuddyAllocator::display`].
#[derive(Debug)]
pub struct Dump<'a, const LEAF_SIZE: usize> {
    buddy: &'a BuddyAllocator<LEAF_SIZE>,
}

impl<const LEAF_SIZE: usize> fmt::Display for Dump<'_, LEAF_SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.buddy.dump(f)
    }
}
