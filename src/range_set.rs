use std::collections::btree_map::{self, BTreeMap};
use std::ops::Range;

/// A set of u64 values optimized for long runs and random insert/delete/contains
#[derive(Debug, Default, Clone)]
pub struct RangeSet(BTreeMap<u64, u64>);

impl RangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, x: u64) -> bool {
        self.pred(x).map_or(false, |(_, end)| end > x)
    }

    pub fn insert_one(&mut self, x: u64) -> bool {
        self.insert(x..x + 1)
    }

    pub fn insert(&mut self, mut x: Range<u64>) -> bool {
        if x.start == x.end {
            return false;
        }
        if let Some((start, end)) = self.pred(x.start) {
            if end >= x.end {
                // wholly contained
                return false;
            }
            if end >= x.start {
                // extend overlapping predecessor
                self.0.remove(&start);
                x.start = start;
            }
        }
        while let Some((start, end)) = self.succ(x.start) {
            if start > x.end {
                break;
            }
            // subsume overlapping successor
            self.0.remove(&start);
            x.end = x.end.max(end);
        }
        self.0.insert(x.start, x.end);
        true
    }

    /// Remove all points in `other` from this set
    pub fn subtract(&mut self, other: &RangeSet) {
        for range in other.iter() {
            self.remove(range);
        }
    }

    pub fn remove(&mut self, x: Range<u64>) {
        if x.start == x.end {
            return;
        }
        if let Some((start, end)) = self.pred(x.start) {
            if start < x.start && end > x.start {
                self.0.insert(start, x.start);
                if end > x.end {
                    self.0.insert(x.end, end);
                    return;
                }
            }
        }
        while let Some((start, end)) = self.succ(x.start) {
            if start >= x.end {
                break;
            }
            self.0.remove(&start);
            if end > x.end {
                self.0.insert(x.end, end);
                break;
            }
        }
    }

    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.0.iter().next()?;
        self.0.remove(&start);
        Some(start..end)
    }

    pub fn min(&self) -> Option<u64> {
        self.0.keys().next().cloned()
    }

    pub fn max(&self) -> Option<u64> {
        self.0.iter().next_back().map(|(_, &end)| end - 1)
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> Iter {
        Iter(self.0.iter())
    }

    fn pred(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range(..=x)
            .next_back()
            .map(|(&start, &end)| (start, end))
    }

    fn succ(&self, x: u64) -> Option<(u64, u64)> {
        self.0.range(x..).next().map(|(&start, &end)| (start, end))
    }
}

pub struct Iter<'a>(btree_map::Iter<'a, u64, u64>);

impl<'a> Iterator for Iter<'a> {
    type Item = Range<u64>;
    fn next(&mut self) -> Option<Range<u64>> {
        self.0.next().map(|(&start, &end)| start..end)
    }
}

impl<'a> DoubleEndedIterator for Iter<'a> {
    fn next_back(&mut self) -> Option<Range<u64>> {
        self.0.next_back().map(|(&start, &end)| start..end)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = Range<u64>;
    type IntoIter = Iter<'a>;
    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merge_and_split() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..2));
        assert!(set.insert(4..6));
        assert_eq!(set.len(), 2);
        assert!(set.insert(2..4));
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..6]);
        assert!(!set.insert_one(3));

        set.remove(2..4);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..2, 4..6]);
    }

    #[test]
    fn contains() {
        let mut set = RangeSet::new();
        set.insert(3..7);
        assert!(!set.contains(2));
        assert!(set.contains(3));
        assert!(set.contains(6));
        assert!(!set.contains(7));
    }

    #[test]
    fn subtract() {
        let mut set = RangeSet::new();
        set.insert(0..10);
        let mut other = RangeSet::new();
        other.insert(2..4);
        other.insert(6..8);
        set.subtract(&other);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..2, 4..6, 8..10]);
    }

    #[test]
    fn min_max_pop() {
        let mut set = RangeSet::new();
        set.insert_one(5);
        set.insert(9..12);
        assert_eq!(set.min(), Some(5));
        assert_eq!(set.max(), Some(11));
        assert_eq!(set.pop_min(), Some(5..6));
        assert_eq!(set.pop_min(), Some(9..12));
        assert_eq!(set.pop_min(), None);
    }
}
