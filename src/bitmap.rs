use core::{fmt, ptr::NonNull};

/// A packed bit array backed by raw bytes.
///
/// Bit `i` lives in byte `i / 8` under mask `1 << (i % 8)`.
pub struct Bitmap {
    num_bits: usize,
    map: NonNull<u8>,
}

impl Bitmap {
    /// Returns the number of bytes needed to store `num_bits` bits.
    #[inline]
    pub const fn num_bytes(num_bits: usize) -> usize {
        num_bits.div_ceil(u8::BITS as usize)
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`.
    ///
    /// All bits are cleared.
    ///
    /// # Safety
    ///
    /// `map` must be valid for reads and writes for
    /// `Bitmap::num_bytes(num_bits)` bytes for as long as the returned
    /// `Bitmap` exists, and no other reference to that memory may be used in
    /// the meantime.
    pub unsafe fn new(num_bits: usize, map: NonNull<u8>) -> Bitmap {
        assert!(num_bits > 0);

        unsafe { map.as_ptr().write_bytes(0, Self::num_bytes(num_bits)) };

        Bitmap { num_bits, map }
    }

    /// Returns the number of bits in the bitmap.
    #[inline]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Returns a tuple of the index of the byte containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u8) {
        (bit / u8::BITS as usize, 1 << (bit % u8::BITS as usize))
    }

    #[inline]
    fn byte_ptr(&self, index: usize) -> (*mut u8, u8) {
        assert!(
            index < self.num_bits,
            "bit index {index} out of range for bitmap of {} bits",
            self.num_bits
        );

        let (byte_idx, mask) = Self::index_and_mask(index);

        // SAFETY: `byte_idx < num_bytes(num_bits)`, which `new` requires to
        // be in bounds of `map`.
        (unsafe { self.map.as_ptr().add(byte_idx) }, mask)
    }

    /// Returns `true` if the indexed bit is set.
    #[inline]
    pub fn is_set(&self, index: usize) -> bool {
        let (byte, mask) = self.byte_ptr(index);

        unsafe { byte.read() & mask != 0 }
    }

    /// Sets the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize) {
        let (byte, mask) = self.byte_ptr(index);

        unsafe { byte.write(byte.read() | mask) };
    }

    /// Clears the indexed bit.
    #[inline]
    pub fn clear(&mut self, index: usize) {
        let (byte, mask) = self.byte_ptr(index);

        unsafe { byte.write(byte.read() & !mask) };
    }

    /// Toggles the indexed bit.
    #[inline]
    pub fn flip(&mut self, index: usize) {
        let (byte, mask) = self.byte_ptr(index);

        unsafe { byte.write(byte.read() ^ mask) };
    }

    /// Returns an iterator over the maximal runs of set bits, as half-open
    /// index ranges.
    pub fn set_ranges(&self) -> SetRanges<'_> {
        SetRanges {
            bitmap: self,
            next: 0,
        }
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.set_ranges()).finish()
    }
}

/// Iterator returned by [`Bitmap::set_ranges`].
pub struct SetRanges<'a> {
    bitmap: &'a Bitmap,
    next: usize,
}

impl Iterator for SetRanges<'_> {
    type Item = core::ops::Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.bitmap.len();

        let start = (self.next..len).find(|&i| self.bitmap.is_set(i))?;
        let end = (start..len)
            .find(|&i| !self.bitmap.is_set(i))
            .unwrap_or(len);

        self.next = end;
        Some(start..end)
    }
}

/// Allocation parity for the sibling pairs of one size class.
///
/// Bit `p` covers blocks `2p` and `2p + 1`. It is flipped exactly once each
/// time either block moves between free and in use (allocated or split), so
/// for a pair whose parent is split it equals `free(2p) XOR free(2p + 1)`,
/// and it is clear for a pair whose parent is not split. Right after a block
/// notes its own transition to free, a set bit means its buddy is in use.
#[derive(Debug)]
pub struct PairState {
    bits: Bitmap,
}

impl PairState {
    /// Returns the number of bits needed to track `num_blocks` blocks.
    #[inline]
    pub const fn num_pairs(num_blocks: usize) -> usize {
        num_blocks.div_ceil(2)
    }

    /// Wraps a zeroed bitmap with one bit per pair.
    pub fn new(bits: Bitmap) -> PairState {
        PairState { bits }
    }

    /// Records that one block of `pair` changed between free and in use.
    #[inline]
    pub fn note_allocation_change(&mut self, pair: usize) {
        self.bits.flip(pair);
    }

    /// Returns `true` if exactly one block of `pair` is free.
    #[inline]
    pub fn is_pair_mixed(&self, pair: usize) -> bool {
        self.bits.is_set(pair)
    }

    /// Returns the underlying bitmap.
    pub fn bits(&self) -> &Bitmap {
        &self.bits
    }
}
