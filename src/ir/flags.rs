//! Status flag sets.
//!
//! A [`FlagSet`] is a set of the six arithmetic status flags at their
//! hardware rflags bit positions, so the same constant that drives liveness
//! analysis doubles as the runtime merge mask the flag-commit handler uses.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// A set of status flags, stored at rflags bit positions.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct FlagSet(u64);

impl FlagSet {
    /// Carry.
    pub const CF: FlagSet = FlagSet(1 << 0);
    /// Parity.
    pub const PF: FlagSet = FlagSet(1 << 2);
    /// Adjust.
    pub const AF: FlagSet = FlagSet(1 << 4);
    /// Zero.
    pub const ZF: FlagSet = FlagSet(1 << 6);
    /// Sign.
    pub const SF: FlagSet = FlagSet(1 << 7);
    /// Overflow.
    pub const OF: FlagSet = FlagSet(1 << 11);

    /// The empty set.
    pub const EMPTY: FlagSet = FlagSet(0);
    /// All six status flags.
    pub const STATUS: FlagSet = FlagSet(1 | (1 << 2) | (1 << 4) | (1 << 6) | (1 << 7) | (1 << 11));

    /// Raw rflags-positioned mask.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether `self` and `other` share no flag.
    pub fn is_disjoint(self, other: FlagSet) -> bool {
        self.0 & other.0 == 0
    }

    /// Whether every flag in `other` is in `self`.
    pub fn contains(self, other: FlagSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set union.
    pub fn union(self, other: FlagSet) -> FlagSet {
        FlagSet(self.0 | other.0)
    }

    /// Flags in `self` but not in `other`.
    pub fn difference(self, other: FlagSet) -> FlagSet {
        FlagSet(self.0 & !other.0)
    }
}

impl BitOr for FlagSet {
    type Output = FlagSet;
    fn bitor(self, rhs: FlagSet) -> FlagSet {
        self.union(rhs)
    }
}

impl BitOrAssign for FlagSet {
    fn bitor_assign(&mut self, rhs: FlagSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut any = false;
        for (flag, name) in [
            (FlagSet::CF, "CF"),
            (FlagSet::PF, "PF"),
            (FlagSet::AF, "AF"),
            (FlagSet::ZF, "ZF"),
            (FlagSet::SF, "SF"),
            (FlagSet::OF, "OF"),
        ] {
            if self.contains(flag) {
                if any {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                any = true;
            }
        }
        if !any {
            f.write_str("-")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mask_matches_rflags_layout() {
        assert_eq!(FlagSet::STATUS.bits(), 0x8d5);
    }

    #[test]
    fn disjoint_and_difference() {
        let defined = FlagSet::CF | FlagSet::ZF;
        assert!(defined.is_disjoint(FlagSet::OF));
        assert!(!defined.is_disjoint(FlagSet::ZF));
        assert_eq!(defined.difference(FlagSet::CF), FlagSet::ZF);
    }
}
