//! Strict-provenance and integer helpers for toolchains that lack them.
//!
//! On newer toolchains the inherent methods of the same names take priority
//! and behave identically.

pub use sptr::Strict;

pub trait UsizeExt {
    fn log2(self) -> u32;
}

impl UsizeExt for usize {
    #[inline]
    fn log2(self) -> u32 {
        Self::BITS - 1 - self.leading_zeros()
    }
}
