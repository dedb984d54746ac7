//! Half-open byte intervals.

use std::fmt;

/// A half-open byte interval `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FileRange {
    begin: u64,
    end: u64,
}

impl FileRange {
    /// Creates `[begin, end)`. An `end` before `begin` is clamped to `begin`.
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin <= end, "range [{begin}, {end}) ends before it begins");
        Self {
            begin,
            end: end.max(begin),
        }
    }

    /// Creates the range of `length` bytes starting at `begin`.
    pub fn with_length(begin: u64, length: u64) -> Self {
        Self::new(begin, begin.saturating_add(length))
    }

    /// First byte of the range.
    pub fn begin(&self) -> u64 {
        self.begin
    }

    /// One past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Whether `offset` lies within the range.
    pub fn contains(&self, offset: u64) -> bool {
        self.begin <= offset && offset < self.end
    }

    /// Whether `other` lies entirely within this range.
    pub fn covers(&self, other: &FileRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    /// Whether the two ranges share at least one byte.
    pub fn overlaps(&self, other: &FileRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Size of the gap between two ranges; zero when they touch or overlap.
    pub fn distance(&self, other: &FileRange) -> u64 {
        if self.end <= other.begin {
            other.begin - self.end
        } else if other.end <= self.begin {
            self.begin - other.end
        } else {
            0
        }
    }

    /// Smallest range spanning both.
    pub fn union(&self, other: &FileRange) -> FileRange {
        FileRange::new(self.begin.min(other.begin), self.end.max(other.end))
    }

    /// Bytes common to both, if any.
    pub fn intersection(&self, other: &FileRange) -> Option<FileRange> {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        (begin < end).then(|| FileRange::new(begin, end))
    }

    /// The range grown by `amount` bytes on each side, saturating at the bounds of `u64`.
    pub fn extend(&self, amount: u64) -> FileRange {
        FileRange::new(
            self.begin.saturating_sub(amount),
            self.end.saturating_add(amount),
        )
    }

    /// The range with its end clamped to `limit`.
    pub fn clamp_end(&self, limit: u64) -> FileRange {
        FileRange::new(self.begin.min(limit), self.end.min(limit))
    }
}

impl fmt::Display for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

impl From<std::ops::Range<u64>> for FileRange {
    fn from(range: std::ops::Range<u64>) -> Self {
        FileRange::new(range.start, range.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        let a = FileRange::new(0, 10);
        assert_eq!(a.distance(&FileRange::new(15, 20)), 5);
        assert_eq!(FileRange::new(15, 20).distance(&a), 5);
        assert_eq!(a.distance(&FileRange::new(10, 12)), 0);
        assert_eq!(a.distance(&FileRange::new(5, 12)), 0);
    }

    #[test]
    fn test_overlap_and_intersection() {
        let a = FileRange::new(10, 20);
        assert!(a.overlaps(&FileRange::new(19, 30)));
        assert!(!a.overlaps(&FileRange::new(20, 30)));
        assert_eq!(a.intersection(&FileRange::new(15, 30)), Some(FileRange::new(15, 20)));
        assert_eq!(a.intersection(&FileRange::new(20, 30)), None);
        assert_eq!(a.union(&FileRange::new(25, 30)), FileRange::new(10, 30));
    }

    #[test]
    fn test_extend_saturates() {
        assert_eq!(FileRange::new(0, 10).extend(5), FileRange::new(0, 15));
        assert_eq!(
            FileRange::new(5, u64::MAX).extend(10),
            FileRange::new(0, u64::MAX)
        );
    }

    #[test]
    fn test_clamp_end() {
        assert_eq!(FileRange::new(10, 100).clamp_end(50), FileRange::new(10, 50));
        assert_eq!(FileRange::new(60, 100).clamp_end(50), FileRange::new(50, 50));
    }
}
