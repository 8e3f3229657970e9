//! Closed intervals of sequence numbers carried by acknowledgements.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed interval `[lower, upper]` of message numbers, `1 <= lower <= upper`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceRange {
    lower: u64,
    upper: u64,
}

impl SequenceRange {
    /// Create a range, rejecting empty or zero-based intervals
    pub fn new(lower: u64, upper: u64) -> Result<Self, crate::WireError> {
        if lower == 0 || lower > upper {
            return Err(crate::WireError::Range(lower, upper));
        }
        Ok(Self { lower, upper })
    }

    /// Range holding exactly one number
    pub fn single(number: u64) -> Result<Self, crate::WireError> {
        Self::new(number, number)
    }

    /// Lowest number in the range
    pub fn lower(&self) -> u64 {
        self.lower
    }

    /// Highest number in the range
    pub fn upper(&self) -> u64 {
        self.upper
    }

    /// Number of message numbers covered
    pub fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }

    /// Always false; present for clippy's `len_without_is_empty`
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Membership test
    pub fn contains(&self, number: u64) -> bool {
        self.lower <= number && number <= self.upper
    }

    /// Whether `other` overlaps or directly touches this range
    pub fn touches(&self, other: &SequenceRange) -> bool {
        self.lower <= other.upper.saturating_add(1) && other.lower <= self.upper.saturating_add(1)
    }

    /// Smallest range covering both
    pub fn union(&self, other: &SequenceRange) -> SequenceRange {
        SequenceRange {
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }
}

impl fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lower == self.upper {
            write!(f, "[{}]", self.lower)
        } else {
            write!(f, "[{}-{}]", self.lower, self.upper)
        }
    }
}
