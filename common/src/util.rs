use core::fmt;

/// Byte lane mask for one 64-bit bus transfer.
///
/// Lanes are little-endian: byte offset 0 is the least significant byte of the doubleword.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ByteMask8 {
    mask: u64,
}

impl ByteMask8 {
    /// Mask covering `width` bytes starting at byte `offset` within the doubleword.
    ///
    /// `width + offset` must not exceed 8.
    #[inline(always)]
    pub fn new<W, A>(width: W, offset: A) -> Self
    where u32: From<W>, u32: From<A> {
        let width = u32::from(width);
        let offset = u32::from(offset);
        debug_assert!(width >= 1 && width + offset <= 8);
        let mask = (!0u64).wrapping_shr(64 - width * 8) << (offset * 8);
        ByteMask8 { mask }
    }

    #[inline(always)]
    pub fn masked_insert(&self, dest: &mut u64, value: u64) {
        *dest = (*dest & !self.mask) | (value & self.mask);
    }

    #[inline(always)]
    pub fn value(&self) -> u64 {
        self.mask
    }

    /// Number of bytes covered by the mask.
    pub fn size(&self) -> u32 {
        self.mask.count_ones() / 8
    }
}

impl Default for ByteMask8 {
    #[inline(always)]
    fn default() -> Self {
        ByteMask8 { mask: !0 }
    }
}

impl fmt::Debug for ByteMask8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteMask8({:016x})", self.mask)
    }
}
