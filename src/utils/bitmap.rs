/// 32-bit fragment bitmap. Bit `i` stands for fragment sequence `i`.
///
/// On the wire the word is sent most-significant-bit first, so sequence `0`
/// is the top bit there; [`AckBitmap::to_wire`] and [`AckBitmap::from_wire`]
/// do the conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AckBitmap(u32);

pub const MAX_SEQ: u8 = 31;

impl AckBitmap {
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    #[must_use]
    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Every bit from `0` through `last`.
    #[must_use]
    pub fn through(last: u8) -> Self {
        assert!(last <= MAX_SEQ);
        if last == MAX_SEQ {
            Self(u32::MAX)
        } else {
            Self((1u32 << (last + 1)) - 1)
        }
    }

    #[must_use]
    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }

    #[inline]
    pub fn set(&mut self, seq: u8) {
        assert!(seq <= MAX_SEQ);
        self.0 |= 1 << seq;
    }

    #[inline]
    pub fn clear(&mut self, seq: u8) {
        assert!(seq <= MAX_SEQ);
        self.0 &= !(1 << seq);
    }

    #[must_use]
    #[inline]
    pub fn is_set(&self, seq: u8) -> bool {
        seq <= MAX_SEQ && self.0 & (1 << seq) != 0
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn lowest(&self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }

    #[must_use]
    pub fn highest(&self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some((31 - self.0.leading_zeros()) as u8)
        }
    }

    #[must_use]
    pub fn all_set_through(&self, last: u8) -> bool {
        let mask = Self::through(last).0;
        self.0 & mask == mask
    }

    /// Bits in `0..=last` that are not set.
    #[must_use]
    pub fn missing_through(&self, last: u8) -> Self {
        Self(!self.0 & Self::through(last).0)
    }

    pub fn merge(&mut self, other: AckBitmap) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: AckBitmap) {
        self.0 &= !other.0;
    }

    #[must_use]
    #[inline]
    pub fn to_wire(&self) -> u32 {
        self.0.reverse_bits()
    }

    #[must_use]
    #[inline]
    pub fn from_wire(wire: u32) -> Self {
        Self(wire.reverse_bits())
    }
}
