//! Per-entry metadata word.
//!
//! Every entry carries a 32-bit flag word next to its key and value. The top
//! two bits belong to the segment, the rest to the storage engine:
//!
//! ```text
//!  31      30      29                                    0
//! +-------+-------+---------------------------------------+
//! |VETOED |PINNED |        engine bookkeeping bits        |
//! +-------+-------+---------------------------------------+
//! ```
//!
//! Segment operations that only mean to touch PINNED or VETOED must carry the
//! engine bits through unchanged.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// Metadata flag word stored alongside each entry.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Metadata(u32);

impl Metadata {
    /// No bits set.
    pub const EMPTY: Metadata = Metadata(0);

    /// Clock reference bit, owned by the bundled paged engine.
    pub const ACCESSED: Metadata = Metadata(1 << 0);

    /// Entry must not be evicted. Set and cleared only by segment writes.
    pub const PINNED: Metadata = Metadata(1 << 30);

    /// The veto predicate matched this entry at its last write.
    pub const VETOED: Metadata = Metadata(1 << 31);

    /// Bits the segment owns. Everything else belongs to the engine.
    pub const SEGMENT_MASK: Metadata = Metadata(Self::PINNED.0 | Self::VETOED.0);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `flag` is set.
    #[inline]
    pub const fn has(self, flag: Metadata) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline]
    pub const fn with(self, flag: Metadata) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline]
    pub const fn without(self, flag: Metadata) -> Self {
        Self(self.0 & !flag.0)
    }

    /// Set or clear `flag` depending on `on`.
    #[inline]
    pub const fn set(self, flag: Metadata, on: bool) -> Self {
        if on { self.with(flag) } else { self.without(flag) }
    }

    /// Keep only the bits in `mask`.
    #[inline]
    pub const fn masked(self, mask: Metadata) -> Self {
        Self(self.0 & mask.0)
    }

    /// An entry may be evicted unless it is vetoed. Pin state and engine bits
    /// play no part here.
    #[inline]
    pub const fn evictable(self) -> bool {
        !self.has(Self::VETOED)
    }

    #[inline]
    pub const fn is_pinned(self) -> bool {
        self.has(Self::PINNED)
    }

    #[inline]
    pub const fn is_vetoed(self) -> bool {
        self.has(Self::VETOED)
    }
}

impl BitOr for Metadata {
    type Output = Metadata;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for Metadata {
    type Output = Metadata;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for Metadata {
    type Output = Metadata;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Metadata({:#010x}", self.0)?;
        if self.is_pinned() {
            write!(f, " PINNED")?;
        }
        if self.is_vetoed() {
            write!(f, " VETOED")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evictable_ignores_other_bits() {
        assert!(Metadata::from_bits(1).evictable());
        assert!(Metadata::EMPTY.evictable());
        assert!(Metadata::PINNED.evictable());
        assert!(!(Metadata::VETOED | Metadata::from_bits(1)).evictable());
        assert!(!Metadata::VETOED.with(Metadata::PINNED).evictable());
    }

    #[test]
    fn test_with_without() {
        let md = Metadata::EMPTY.with(Metadata::PINNED);
        assert!(md.is_pinned());
        assert!(!md.is_vetoed());

        let md = md.with(Metadata::VETOED).without(Metadata::PINNED);
        assert!(!md.is_pinned());
        assert!(md.is_vetoed());
    }

    #[test]
    fn test_set_preserves_engine_bits() {
        let md = Metadata::ACCESSED.with(Metadata::from_bits(1 << 5));
        let md = md.set(Metadata::PINNED, true).set(Metadata::VETOED, false);
        assert!(md.has(Metadata::ACCESSED));
        assert!(md.has(Metadata::from_bits(1 << 5)));
        assert!(md.is_pinned());

        let md = md.set(Metadata::PINNED, false);
        assert_eq!(md, Metadata::ACCESSED.with(Metadata::from_bits(1 << 5)));
    }

    #[test]
    fn test_masked() {
        let md = Metadata::ACCESSED | Metadata::VETOED | Metadata::PINNED;
        assert_eq!(md.masked(Metadata::VETOED), Metadata::VETOED);
        assert_eq!(md.masked(Metadata::SEGMENT_MASK), Metadata::VETOED | Metadata::PINNED);
        assert_eq!(md.masked(!Metadata::SEGMENT_MASK), Metadata::ACCESSED);
    }

    #[test]
    fn test_debug() {
        let s = format!("{:?}", Metadata::PINNED | Metadata::VETOED);
        assert!(s.contains("PINNED"));
        assert!(s.contains("VETOED"));
        assert_eq!(format!("{:?}", Metadata::EMPTY), "Metadata(0x00000000)");
    }
}
