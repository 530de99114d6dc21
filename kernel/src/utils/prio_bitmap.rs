//! A fixed-size bitmap for O(1) "find highest set bit" queries, used by the
//! per-core ready queue (§4.8) to pick the next task to run without scanning
//! all [`crate::cfg::NUM_PRIORITIES`] priority lists.
//!
//! Adapted from `r3_kernel::utils::prio_bitmap::PrioBitmap`, which is generic
//! over a const bit length dispatched through a `BinaryInteger`-like trait so
//! it can back both 32- and 64-level configurations of an open set of ports.
//! We only ever need [`crate::cfg::NUM_PRIORITIES`] (32) levels for this one
//! hardware family, so this is a single `u32` wrapper instead.

use crate::cfg::NUM_PRIORITIES;

const _: () = assert!(NUM_PRIORITIES <= 32, "PrioBitmap only holds 32 levels");

/// A bitmap of `NUM_PRIORITIES` bits, bit `i` set meaning "priority level `i`
/// has at least one ready task".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrioBitmap(u32);

impl PrioBitmap {
    pub const fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub fn set(&mut self, level: usize) {
        debug_assert!(level < NUM_PRIORITIES);
        self.0 |= 1 << level;
    }

    #[inline]
    pub fn clear(&mut self, level: usize) {
        debug_assert!(level < NUM_PRIORITIES);
        self.0 &= !(1 << level);
    }

    #[inline]
    pub fn get(&self, level: usize) -> bool {
        debug_assert!(level < NUM_PRIORITIES);
        (self.0 & (1 << level)) != 0
    }

    /// Returns the lowest set bit index (i.e. the highest-urgency nonempty
    /// priority level, since priority 0 is highest per §3), or `None` if the
    /// bitmap is empty.
    #[inline]
    pub fn find_set(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_finds_nothing() {
        assert_eq!(PrioBitmap::new().find_set(), None);
    }

    #[test]
    fn find_set_picks_lowest_index() {
        let mut bm = PrioBitmap::new();
        bm.set(5);
        bm.set(2);
        bm.set(9);
        assert_eq!(bm.find_set(), Some(2));
        bm.clear(2);
        assert_eq!(bm.find_set(), Some(5));
    }

    #[quickcheck_macros::quickcheck]
    fn set_then_get_is_true(level: usize) -> quickcheck::TestResult {
        let level = level % NUM_PRIORITIES;
        let mut bm = PrioBitmap::new();
        bm.set(level);
        quickcheck::TestResult::from_bool(bm.get(level))
    }

    #[quickcheck_macros::quickcheck]
    fn clear_then_get_is_false(levels: Vec<usize>) -> quickcheck::TestResult {
        let mut bm = PrioBitmap::new();
        let levels: Vec<usize> = levels.into_iter().map(|l| l % NUM_PRIORITIES).collect();
        for &l in &levels {
            bm.set(l);
        }
        for &l in &levels {
            bm.clear(l);
        }
        quickcheck::TestResult::from_bool(bm.is_empty())
    }
}
