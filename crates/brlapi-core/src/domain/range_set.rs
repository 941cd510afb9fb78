//! Sparse integer set stored as sorted, disjoint, closed intervals.
//!
//! Used for per-connection key masking: the set holds the values a client
//! *wants* to receive.  Adding a range merges it with any overlapping or
//! adjacent interval; removing a range trims or splits the intervals it
//! touches.  Lookups are a binary search over the interval list.

use thiserror::Error;

/// Errors returned by [`RangeSet`] mutators.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeSetError {
    /// The lower bound is above the upper bound.
    #[error("invalid range {lo}..={hi}")]
    InvalidRange { lo: u32, hi: u32 },

    /// Growing the interval list failed.
    #[error("out of memory while growing range set")]
    OutOfMemory,
}

/// A set of `u32` values kept as `(lo, hi)` inclusive intervals.
///
/// Invariant: intervals are sorted by `lo`, pairwise disjoint and
/// non-adjacent, and every interval has `lo <= hi`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<(u32, u32)>,
}

impl RangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Adds every value in `lo..=hi`.
    ///
    /// # Errors
    ///
    /// [`RangeSetError::InvalidRange`] if `lo > hi`;
    /// [`RangeSetError::OutOfMemory`] if the list cannot grow.
    pub fn add(&mut self, lo: u32, hi: u32) -> Result<(), RangeSetError> {
        check(lo, hi)?;
        // First interval that could touch [lo, hi]: its end reaches lo - 1.
        let start = self
            .ranges
            .partition_point(|&(_, h)| h < lo.saturating_sub(1));
        let mut end = start;
        let mut new_lo = lo;
        let mut new_hi = hi;
        while end < self.ranges.len() {
            let (l, h) = self.ranges[end];
            if u64::from(l) > u64::from(hi) + 1 {
                break;
            }
            new_lo = new_lo.min(l);
            new_hi = new_hi.max(h);
            end += 1;
        }
        if start == end {
            self.ranges
                .try_reserve(1)
                .map_err(|_| RangeSetError::OutOfMemory)?;
            self.ranges.insert(start, (new_lo, new_hi));
        } else {
            self.ranges[start] = (new_lo, new_hi);
            self.ranges.drain(start + 1..end);
        }
        Ok(())
    }

    /// Removes every value in `lo..=hi`.
    ///
    /// # Errors
    ///
    /// [`RangeSetError::InvalidRange`] if `lo > hi`;
    /// [`RangeSetError::OutOfMemory`] if splitting an interval needs room
    /// that cannot be allocated.
    pub fn remove(&mut self, lo: u32, hi: u32) -> Result<(), RangeSetError> {
        check(lo, hi)?;
        let start = self.ranges.partition_point(|&(_, h)| h < lo);
        let mut i = start;
        while i < self.ranges.len() {
            let (l, h) = self.ranges[i];
            if l > hi {
                break;
            }
            match (l < lo, h > hi) {
                (true, true) => {
                    self.ranges
                        .try_reserve(1)
                        .map_err(|_| RangeSetError::OutOfMemory)?;
                    self.ranges[i] = (l, lo - 1);
                    self.ranges.insert(i + 1, (hi + 1, h));
                    return Ok(());
                }
                (true, false) => {
                    self.ranges[i] = (l, lo - 1);
                    i += 1;
                }
                (false, true) => {
                    self.ranges[i] = (hi + 1, h);
                    return Ok(());
                }
                (false, false) => {
                    self.ranges.remove(i);
                }
            }
        }
        Ok(())
    }

    /// Returns `true` if `value` lies in some interval.
    pub fn contains(&self, value: u32) -> bool {
        let idx = self.ranges.partition_point(|&(_, h)| h < value);
        self.ranges
            .get(idx)
            .map_or(false, |&(l, _)| l <= value)
    }

    /// Returns the intervals in ascending order.
    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    /// Returns `true` if the set holds no values.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Removes every value.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

fn check(lo: u32, hi: u32) -> Result<(), RangeSetError> {
    if lo > hi {
        Err(RangeSetError::InvalidRange { lo, hi })
    } else {
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: u32 = 96;

    /// Boolean-array model of the same set.
    struct Reference([bool; DOMAIN as usize]);

    impl Reference {
        fn apply(&mut self, add: bool, lo: u32, hi: u32) {
            for v in lo..=hi.min(DOMAIN - 1) {
                self.0[v as usize] = add;
            }
        }
    }

    fn assert_invariants(set: &RangeSet) {
        for w in set.ranges().windows(2) {
            assert!(w[0].1 + 1 < w[1].0, "intervals must be disjoint and non-adjacent: {w:?}");
        }
        for &(l, h) in set.ranges() {
            assert!(l <= h);
        }
    }

    /// Small deterministic generator so the sequence is reproducible.
    fn lcg(state: &mut u64) -> u32 {
        *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (*state >> 33) as u32
    }

    #[test]
    fn test_matches_boolean_array_reference_over_random_sequences() {
        for seed in 0..40u64 {
            // Arrange
            let mut state = seed;
            let mut set = RangeSet::new();
            let mut reference = Reference([false; DOMAIN as usize]);

            for _ in 0..60 {
                let a = lcg(&mut state) % DOMAIN;
                let b = lcg(&mut state) % DOMAIN;
                let (lo, hi) = (a.min(b), a.max(b));
                let add = lcg(&mut state) % 3 != 0;

                // Act
                if add {
                    set.add(lo, hi).unwrap();
                } else {
                    set.remove(lo, hi).unwrap();
                }
                reference.apply(add, lo, hi);

                // Assert
                assert_invariants(&set);
                for v in 0..DOMAIN {
                    assert_eq!(
                        set.contains(v),
                        reference.0[v as usize],
                        "seed {seed}, value {v}, ranges {:?}",
                        set.ranges()
                    );
                }
            }
        }
    }

    #[test]
    fn test_add_merges_adjacent_intervals() {
        let mut set = RangeSet::new();
        set.add(1, 3).unwrap();
        set.add(4, 6).unwrap();
        assert_eq!(set.ranges(), &[(1, 6)]);
    }

    #[test]
    fn test_add_bridges_several_intervals() {
        let mut set = RangeSet::new();
        set.add(0, 1).unwrap();
        set.add(5, 6).unwrap();
        set.add(10, 12).unwrap();
        set.add(2, 9).unwrap();
        assert_eq!(set.ranges(), &[(0, 12)]);
    }

    #[test]
    fn test_remove_splits_interval() {
        let mut set = RangeSet::new();
        set.add(0, 10).unwrap();
        set.remove(4, 6).unwrap();
        assert_eq!(set.ranges(), &[(0, 3), (7, 10)]);
    }

    #[test]
    fn test_remove_trims_both_neighbours() {
        let mut set = RangeSet::new();
        set.add(0, 5).unwrap();
        set.add(10, 15).unwrap();
        set.remove(3, 12).unwrap();
        assert_eq!(set.ranges(), &[(0, 2), (13, 15)]);
    }

    #[test]
    fn test_full_u32_range_edges() {
        let mut set = RangeSet::new();
        set.add(0, u32::MAX).unwrap();
        assert!(set.contains(u32::MAX));
        set.remove(0, 0).unwrap();
        set.remove(u32::MAX, u32::MAX).unwrap();
        assert_eq!(set.ranges(), &[(1, u32::MAX - 1)]);
        set.add(u32::MAX, u32::MAX).unwrap();
        assert_eq!(set.ranges(), &[(1, u32::MAX)]);
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let mut set = RangeSet::new();
        assert_eq!(
            set.add(5, 4),
            Err(RangeSetError::InvalidRange { lo: 5, hi: 4 })
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_clear_empties_set() {
        let mut set = RangeSet::new();
        set.add(1, 2).unwrap();
        set.clear();
        assert!(!set.contains(1));
    }
}
