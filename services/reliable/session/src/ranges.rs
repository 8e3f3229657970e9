//! Immutable sorted set of disjoint, maximally coalesced sequence ranges.

use rm_wire::SequenceRange;
use std::fmt;
use std::sync::Arc;

/// Sorted, non-overlapping, adjacency-merged set of [`SequenceRange`]s.
///
/// Every operation returns a new collection; existing values are shared
/// between the receive path and the acknowledgements built from them.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct SequenceRangeCollection {
    ranges: Arc<Vec<SequenceRange>>,
}

impl SequenceRangeCollection {
    /// The empty collection
    pub fn empty() -> Self {
        Self::default()
    }

    /// Normalize an arbitrary list of ranges
    pub fn from_ranges<I: IntoIterator<Item = SequenceRange>>(ranges: I) -> Self {
        ranges
            .into_iter()
            .fold(Self::empty(), |acc, range| acc.merge_range(range))
    }

    /// Insert a single number
    pub fn merge_with(&self, number: u64) -> Self {
        match SequenceRange::single(number) {
            Ok(range) => self.merge_range(range),
            Err(_) => self.clone(),
        }
    }

    /// Insert a range, coalescing with overlapping or touching neighbours
    pub fn merge_range(&self, range: SequenceRange) -> Self {
        let ranges = self.ranges.as_slice();

        // First range whose upper bound could touch `range`
        let start = ranges.partition_point(|r| r.upper().saturating_add(1) < range.lower());
        let mut end = start;
        let mut merged = range;
        while end < ranges.len() && ranges[end].touches(&merged) {
            merged = merged.union(&ranges[end]);
            end += 1;
        }

        if end == start + 1 && ranges[start] == merged {
            return self.clone();
        }

        let mut next = Vec::with_capacity(ranges.len() + 1 - (end - start));
        next.extend_from_slice(&ranges[..start]);
        next.push(merged);
        next.extend_from_slice(&ranges[end..]);

        Self {
            ranges: Arc::new(next),
        }
    }

    /// Membership test
    pub fn contains(&self, number: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.upper() < number);
        self.ranges
            .get(idx)
            .map(|r| r.contains(number))
            .unwrap_or(false)
    }

    /// Whether merging `number` would leave the range count unchanged or lower
    pub fn merge_keeps_count(&self, number: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.upper().saturating_add(1) < number);
        self.ranges
            .get(idx)
            .map(|r| r.lower() <= number.saturating_add(1))
            .unwrap_or(false)
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether no number has been merged
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Highest number merged so far
    pub fn highest(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.upper())
    }

    /// Whether the collection is exactly `[1, last]`
    pub fn is_complete_through(&self, last: u64) -> bool {
        match self.ranges.as_slice() {
            [only] => only.lower() == 1 && only.upper() == last,
            _ => false,
        }
    }

    /// Iterate ranges in ascending order
    pub fn iter(&self) -> impl Iterator<Item = &SequenceRange> {
        self.ranges.iter()
    }

    /// Borrow the ranges
    pub fn as_slice(&self) -> &[SequenceRange] {
        self.ranges.as_slice()
    }
}

impl fmt::Debug for SequenceRangeCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ranges.iter()).finish()
    }
}

impl fmt::Display for SequenceRangeCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", range)?;
        }
        write!(f, "}}")
    }
}
