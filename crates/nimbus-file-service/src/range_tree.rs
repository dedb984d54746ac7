//! Ordered set of disjoint byte ranges.
//!
//! [`FileRangeTree`] records which spans of a file are present in local
//! storage. Ranges are kept pairwise disjoint and sorted by their first byte;
//! [`insert`](FileRangeTree::insert) coalesces a new range with every stored
//! range that overlaps it or lies closer than the tree's minimum distance,
//! so small holes do not fragment the set.
//!
//! The tree is keyed by range begin in a `BTreeMap`. Because stored ranges
//! are disjoint, their ends are ordered the same way as their begins, which
//! makes every point and overlap query a single ordered-map seek.
//!
//! The tree is not internally synchronized.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::error::FileRangeError;
use crate::range::FileRange;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry<V> {
    end: u64,
    value: V,
}

/// Disjoint byte ranges, each carrying a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRangeTree<V = ()> {
    ranges: BTreeMap<u64, Entry<V>>,
    minimum_distance: u64,
}

impl<V> Default for FileRangeTree<V> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<V> FileRangeTree<V> {
    /// Creates an empty tree that merges ranges closer than `minimum_distance`.
    pub fn new(minimum_distance: u64) -> Self {
        Self {
            ranges: BTreeMap::new(),
            minimum_distance,
        }
    }

    pub fn minimum_distance(&self) -> u64 {
        self.minimum_distance
    }

    /// Changes the merge distance. Already stored ranges are left as they are.
    pub fn set_minimum_distance(&mut self, minimum_distance: u64) {
        self.minimum_distance = minimum_distance;
    }

    /// Whether `a` and `b` would be merged by [`insert`](Self::insert).
    pub fn mergeable(&self, a: &FileRange, b: &FileRange) -> bool {
        a.overlaps(b) || (self.minimum_distance > 0 && a.distance(b) < self.minimum_distance)
    }

    /// Adds `range` with `value` without merging.
    pub fn try_add(&mut self, range: FileRange, value: V) -> Result<(), FileRangeError> {
        if range.is_empty() {
            return Err(FileRangeError::Empty);
        }
        if self.overlapping(range).next().is_some() {
            return Err(FileRangeError::Overlaps);
        }
        self.ranges.insert(
            range.begin(),
            Entry {
                end: range.end(),
                value,
            },
        );
        Ok(())
    }

    /// The stored range containing `offset`.
    pub fn find(&self, offset: u64) -> Option<(FileRange, &V)> {
        self.ranges
            .range(..=offset)
            .next_back()
            .filter(|(_, entry)| entry.end > offset)
            .map(|(&begin, entry)| (FileRange::new(begin, entry.end), &entry.value))
    }

    /// Mutable access to the value of the stored range containing `offset`.
    pub fn find_mut(&mut self, offset: u64) -> Option<(FileRange, &mut V)> {
        self.ranges
            .range_mut(..=offset)
            .next_back()
            .filter(|(_, entry)| entry.end > offset)
            .map(|(&begin, entry)| (FileRange::new(begin, entry.end), &mut entry.value))
    }

    /// Stored ranges sharing at least one byte with `range`, in order.
    pub fn overlapping(&self, range: FileRange) -> impl Iterator<Item = (FileRange, &V)> {
        let start = self.find(range.begin()).map_or(range.begin(), |(r, _)| r.begin());
        let upper = if range.is_empty() {
            Bound::Excluded(start)
        } else {
            Bound::Excluded(range.end())
        };
        self.ranges
            .range((Bound::Included(start), upper))
            .map(|(&begin, entry)| (FileRange::new(begin, entry.end), &entry.value))
    }

    /// Stored ranges beginning at or after `offset`.
    pub fn begins_after(&self, offset: u64) -> impl Iterator<Item = (FileRange, &V)> {
        self.ranges
            .range(offset..)
            .map(|(&begin, entry)| (FileRange::new(begin, entry.end), &entry.value))
    }

    /// Stored ranges ending after `offset`, including one that contains it.
    pub fn ends_after(&self, offset: u64) -> impl Iterator<Item = (FileRange, &V)> {
        let start = self.find(offset).map_or(offset, |(r, _)| r.begin());
        self.ranges
            .range(start..)
            .map(|(&begin, entry)| (FileRange::new(begin, entry.end), &entry.value))
    }

    /// The last stored range ending at or before `offset`.
    pub fn ends_before(&self, offset: u64) -> Option<(FileRange, &V)> {
        self.ranges
            .range(..offset)
            .rev()
            .find(|(_, entry)| entry.end <= offset)
            .map(|(&begin, entry)| (FileRange::new(begin, entry.end), &entry.value))
    }

    pub fn first(&self) -> Option<(FileRange, &V)> {
        self.ranges
            .first_key_value()
            .map(|(&begin, entry)| (FileRange::new(begin, entry.end), &entry.value))
    }

    pub fn last(&self) -> Option<(FileRange, &V)> {
        self.ranges
            .last_key_value()
            .map(|(&begin, entry)| (FileRange::new(begin, entry.end), &entry.value))
    }

    /// All stored ranges in order.
    pub fn iter(&self) -> impl Iterator<Item = (FileRange, &V)> {
        self.ranges
            .iter()
            .map(|(&begin, entry)| (FileRange::new(begin, entry.end), &entry.value))
    }

    /// Stored ranges without their values.
    pub fn ranges(&self) -> Vec<FileRange> {
        self.iter().map(|(range, _)| range).collect()
    }

    /// Spans of `range` not covered by any stored range.
    pub fn gaps(&self, range: FileRange) -> Vec<FileRange> {
        let mut gaps = Vec::new();
        let mut cursor = range.begin();
        for (stored, _) in self.overlapping(range) {
            if stored.begin() > cursor {
                gaps.push(FileRange::new(cursor, stored.begin()));
            }
            cursor = cursor.max(stored.end());
        }
        if cursor < range.end() {
            gaps.push(FileRange::new(cursor, range.end()));
        }
        gaps
    }

    /// Whether every byte of `range` is covered.
    pub fn covers(&self, range: FileRange) -> bool {
        range.is_empty() || self.find(range.begin()).is_some_and(|(r, _)| r.covers(&range))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Number of bytes covered.
    pub fn total_len(&self) -> u64 {
        self.ranges
            .iter()
            .map(|(&begin, entry)| entry.end - begin)
            .sum()
    }

    /// Begins of stored ranges that [`insert`](Self::insert) would merge with `range`.
    fn merge_candidates(&self, range: FileRange) -> Vec<u64> {
        let reach = range.end().saturating_add(self.minimum_distance);
        let mut keys: Vec<u64> = self
            .ranges
            .range(..=reach)
            .rev()
            .take_while(|&(&begin, entry)| {
                let stored = FileRange::new(begin, entry.end);
                stored.end() >= range.begin().saturating_sub(self.minimum_distance)
            })
            .filter(|&(&begin, entry)| self.mergeable(&FileRange::new(begin, entry.end), &range))
            .map(|(&begin, _)| begin)
            .collect();
        keys.reverse();
        keys
    }
}

impl<V: Default> FileRangeTree<V> {
    /// Inserts `range`, merging it with every stored range that overlaps it
    /// or lies closer than the minimum distance.
    ///
    /// Returns the range that now covers `range`. Merged ranges' values are
    /// replaced by `V::default()`; a range already covered by a single stored
    /// range leaves the tree untouched.
    pub fn insert(&mut self, range: FileRange) -> Result<FileRange, FileRangeError> {
        if range.is_empty() {
            return Err(FileRangeError::Empty);
        }

        let candidates = self.merge_candidates(range);
        if let &[begin] = candidates.as_slice()
            && let Some(entry) = self.ranges.get(&begin)
            && FileRange::new(begin, entry.end).covers(&range)
        {
            return Ok(FileRange::new(begin, entry.end));
        }

        let mut merged = range;
        for begin in candidates {
            if let Some(entry) = self.ranges.remove(&begin) {
                merged = merged.union(&FileRange::new(begin, entry.end));
            }
        }
        self.ranges.insert(
            merged.begin(),
            Entry {
                end: merged.end(),
                value: V::default(),
            },
        );
        Ok(merged)
    }
}

impl<V: Clone> FileRangeTree<V> {
    /// Removes every byte of `range`. Stored ranges partly inside it are
    /// clipped or split; nothing is merged.
    ///
    /// Returns the stored ranges that were affected, as they were before removal.
    pub fn remove(&mut self, range: FileRange) -> Vec<FileRange> {
        if range.is_empty() {
            return Vec::new();
        }

        let affected: Vec<FileRange> = self.overlapping(range).map(|(r, _)| r).collect();
        for stored in &affected {
            let Some(entry) = self.ranges.remove(&stored.begin()) else {
                continue;
            };
            if stored.begin() < range.begin() {
                self.ranges.insert(
                    stored.begin(),
                    Entry {
                        end: range.begin(),
                        value: entry.value.clone(),
                    },
                );
            }
            if range.end() < stored.end() {
                self.ranges.insert(
                    range.end(),
                    Entry {
                        end: stored.end(),
                        value: entry.value,
                    },
                );
            }
        }
        affected
    }

    /// Drops every byte at or beyond `size`.
    pub fn truncate(&mut self, size: u64) -> Vec<FileRange> {
        self.remove(FileRange::new(size, u64::MAX))
    }
}

impl FromIterator<FileRange> for FileRangeTree {
    fn from_iter<I: IntoIterator<Item = FileRange>>(iter: I) -> Self {
        let mut tree = FileRangeTree::default();
        for range in iter {
            let _ = tree.insert(range);
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn r(begin: u64, end: u64) -> FileRange {
        FileRange::new(begin, end)
    }

    #[test]
    fn test_empty_range_rejected() {
        let mut tree: FileRangeTree = FileRangeTree::new(4);
        assert_eq!(tree.insert(r(5, 5)), Err(FileRangeError::Empty));
        assert_eq!(tree.try_add(r(5, 5), ()), Err(FileRangeError::Empty));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_insert_absorbs_contained_ranges() {
        let mut tree: FileRangeTree = FileRangeTree::new(0);
        for range in [r(10, 20), r(30, 40), r(50, 60)] {
            tree.insert(range).unwrap();
        }
        assert_eq!(tree.insert(r(5, 65)).unwrap(), r(5, 65));
        assert_eq!(tree.ranges(), vec![r(5, 65)]);
    }

    #[test]
    fn test_touching_ranges_with_zero_distance_stay_distinct() {
        let mut tree: FileRangeTree = FileRangeTree::new(0);
        tree.insert(r(0, 10)).unwrap();
        tree.insert(r(10, 20)).unwrap();
        assert_eq!(tree.ranges(), vec![r(0, 10), r(10, 20)]);
    }

    #[test]
    fn test_merge_bridges_neighbours_on_both_sides() {
        let mut tree: FileRangeTree = FileRangeTree::new(10);
        tree.insert(r(0, 100)).unwrap();
        tree.insert(r(200, 300)).unwrap();
        assert_eq!(tree.insert(r(105, 195)).unwrap(), r(0, 300));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_try_add_rejects_overlap() {
        let mut tree = FileRangeTree::new(0);
        tree.try_add(r(10, 20), 'a').unwrap();
        assert_eq!(tree.try_add(r(15, 25), 'b'), Err(FileRangeError::Overlaps));
        tree.try_add(r(20, 25), 'b').unwrap();
        assert_eq!(tree.find(22), Some((r(20, 25), &'b')));
    }

    #[test]
    fn test_find_and_queries() {
        let tree: FileRangeTree = [r(0, 10), r(20, 30), r(40, 50)].into_iter().collect();
        assert_eq!(tree.find(25).map(|(r, _)| r), Some(r(20, 30)));
        assert_eq!(tree.find(30), None);
        let overlapping: Vec<_> = tree.overlapping(r(5, 45)).map(|(r, _)| r).collect();
        assert_eq!(overlapping, vec![r(0, 10), r(20, 30), r(40, 50)]);
        let ends_after: Vec<_> = tree.ends_after(25).map(|(r, _)| r).collect();
        assert_eq!(ends_after, vec![r(20, 30), r(40, 50)]);
        let begins_after: Vec<_> = tree.begins_after(25).map(|(r, _)| r).collect();
        assert_eq!(begins_after, vec![r(40, 50)]);
        assert_eq!(tree.ends_before(35).map(|(r, _)| r), Some(r(20, 30)));
        assert_eq!(tree.first().map(|(r, _)| r), Some(r(0, 10)));
        assert_eq!(tree.last().map(|(r, _)| r), Some(r(40, 50)));
    }

    #[test]
    fn test_gaps() {
        let tree: FileRangeTree = [r(10, 20), r(30, 40)].into_iter().collect();
        assert_eq!(tree.gaps(r(0, 50)), vec![r(0, 10), r(20, 30), r(40, 50)]);
        assert_eq!(tree.gaps(r(12, 18)), Vec::<FileRange>::new());
        assert!(tree.covers(r(12, 18)));
        assert!(!tree.covers(r(12, 25)));
    }

    #[test]
    fn test_remove_splits_without_merging() {
        let mut tree: FileRangeTree = FileRangeTree::new(100);
        tree.insert(r(0, 100)).unwrap();
        let affected = tree.remove(r(40, 60));
        assert_eq!(affected, vec![r(0, 100)]);
        assert_eq!(tree.ranges(), vec![r(0, 40), r(60, 100)]);
        assert_eq!(tree.total_len(), 80);
    }

    #[test]
    fn test_truncate() {
        let mut tree: FileRangeTree = [r(0, 10), r(20, 30), r(40, 50)].into_iter().collect();
        tree.truncate(25);
        assert_eq!(tree.ranges(), vec![r(0, 10), r(20, 25)]);
    }

    fn arb_range() -> impl Strategy<Value = FileRange> {
        (0u64..10_000, 1u64..500).prop_map(|(begin, len)| FileRange::with_length(begin, len))
    }

    proptest! {
        #[test]
        fn prop_close_ranges_merge(a in arb_range(), gap in 0u64..10, distance in 10u64..50) {
            let b = FileRange::with_length(a.end() + gap, 7);
            let mut tree: FileRangeTree = FileRangeTree::new(distance);
            tree.insert(a).unwrap();
            tree.insert(b).unwrap();
            prop_assert_eq!(tree.ranges(), vec![FileRange::new(a.begin(), b.end())]);
        }

        #[test]
        fn prop_overlapping_ranges_merge(a in arb_range(), b in arb_range()) {
            prop_assume!(a.overlaps(&b));
            let mut tree: FileRangeTree = FileRangeTree::new(0);
            tree.insert(a).unwrap();
            tree.insert(b).unwrap();
            prop_assert_eq!(tree.ranges(), vec![a.union(&b)]);
        }

        #[test]
        fn prop_distant_ranges_stay_distinct(a in arb_range(), extra in 0u64..100, distance in 1u64..50) {
            let b = FileRange::with_length(a.end() + distance + extra, 3);
            let mut tree: FileRangeTree = FileRangeTree::new(distance);
            tree.insert(b).unwrap();
            tree.insert(a).unwrap();
            prop_assert_eq!(tree.ranges(), vec![a, b]);
            prop_assert_eq!(tree.find(a.begin()).map(|(r, _)| r), Some(a));
            prop_assert_eq!(tree.find(b.begin()).map(|(r, _)| r), Some(b));
        }

        #[test]
        fn prop_insert_is_idempotent(ranges in prop::collection::vec(arb_range(), 1..20), distance in 0u64..64) {
            let mut once: FileRangeTree = FileRangeTree::new(distance);
            let mut twice: FileRangeTree = FileRangeTree::new(distance);
            for range in &ranges {
                once.insert(*range).unwrap();
                twice.insert(*range).unwrap();
                twice.insert(*range).unwrap();
            }
            prop_assert_eq!(once.ranges(), twice.ranges());
        }

        #[test]
        fn prop_ranges_stay_disjoint_and_spaced(ranges in prop::collection::vec(arb_range(), 1..40), distance in 0u64..64) {
            let mut tree: FileRangeTree = FileRangeTree::new(distance);
            for range in &ranges {
                tree.insert(*range).unwrap();
            }
            let stored = tree.ranges();
            for pair in stored.windows(2) {
                prop_assert!(pair[0].end() <= pair[1].begin());
                prop_assert!(!tree.mergeable(&pair[0], &pair[1]));
            }
            for range in &ranges {
                prop_assert!(tree.covers(*range));
            }
        }
    }
}
