//! Receive-side sequence tracking.
//!
//! [`ReliableInputConnection`] validates incoming message numbers against the
//! terminal boundary, merges them into the acknowledgement ranges and reports
//! when every message of the sequence has arrived.

use crate::ranges::SequenceRangeCollection;
use rm_wire::ProtocolVersion;
use thiserror::Error;
use tracing::debug;

/// Inconsistency between an advertised last message number and the ranges seen
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryError {
    /// The advertised last number is below a number already received
    #[error("last message number {last} is smaller than the highest received number {highest}")]
    SmallLastNumber {
        /// Advertised last number
        last: u64,
        /// Highest number received
        highest: u64,
    },
    /// The advertised last number disagrees with the received ranges
    #[error("last message number {last} is inconsistent with the received ranges")]
    Inconsistent {
        /// Advertised last number
        last: u64,
    },
}

/// Receive-side state of one sequence
#[derive(Debug, Clone)]
pub struct ReliableInputConnection {
    version: ProtocolVersion,
    ranges: SequenceRangeCollection,
    last: Option<u64>,
    closed: bool,
    terminated: bool,
    max_ranges: usize,
}

impl ReliableInputConnection {
    /// Create an empty input connection
    pub fn new(version: ProtocolVersion, max_ranges: usize) -> Self {
        Self {
            version,
            ranges: SequenceRangeCollection::empty(),
            last: None,
            closed: false,
            terminated: false,
            max_ranges: max_ranges.max(1),
        }
    }

    /// Ranges received so far
    pub fn ranges(&self) -> &SequenceRangeCollection {
        &self.ranges
    }

    /// Terminal boundary, once known
    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Whether a CloseSequence established the boundary
    pub fn is_sequence_closed(&self) -> bool {
        self.closed
    }

    /// Whether [`Self::terminate`] succeeded
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Whether `number` may be accepted.
    ///
    /// A number beyond a known boundary is rejected. On February 2005 a
    /// LastMessage marker must agree with any boundary already established and
    /// may not sit below a number already received.
    pub fn is_valid(&self, number: u64, is_last: bool) -> bool {
        if number == 0 {
            return false;
        }

        match self.last {
            Some(last) if is_last => number == last,
            // The boundary number belongs to the LastMessage itself
            Some(last) if self.version.uses_last_message_marker() => number < last,
            Some(last) => number <= last,
            // A marker must land strictly above everything already received
            None if is_last => self.ranges.highest().map_or(true, |h| number > h),
            None => true,
        }
    }

    /// Whether merging `number` keeps the range count within bounds
    pub fn can_merge(&self, number: u64) -> bool {
        self.ranges.len() < self.max_ranges || self.ranges.merge_keeps_count(number)
    }

    /// Whether `number` was already received
    pub fn contains(&self, number: u64) -> bool {
        self.ranges.contains(number)
    }

    /// Merge `number`; returns whether every message through the boundary has arrived
    pub fn merge(&mut self, number: u64, is_last: bool) -> bool {
        if is_last && self.last.is_none() {
            debug!("Last message number established at {}", number);
            self.last = Some(number);
        }
        self.ranges = self.ranges.merge_with(number);
        self.all_added()
    }

    /// Establish the boundary from a CloseSequence (1.1)
    pub fn set_close_sequence_last(&mut self, last: u64) -> Result<(), BoundaryError> {
        debug_assert!(self.version.supports_close_sequence());

        if let Some(highest) = self.ranges.highest() {
            if last < highest {
                return Err(BoundaryError::SmallLastNumber { last, highest });
            }
        }
        if let Some(known) = self.last {
            if known != last {
                return Err(BoundaryError::Inconsistent { last });
            }
        }

        self.closed = true;
        self.last = Some(last);
        Ok(())
    }

    /// Establish the boundary from a TerminateSequence (1.1).
    ///
    /// Termination asserts that every message was received, so the ranges
    /// must be exactly `[1, last]`.
    pub fn set_terminate_sequence_last(&mut self, last: u64) -> Result<(), BoundaryError> {
        debug_assert!(self.version.has_terminate_response());

        if let Some(highest) = self.ranges.highest() {
            if last < highest {
                return Err(BoundaryError::SmallLastNumber { last, highest });
            }
        }
        if let Some(known) = self.last {
            if known != last {
                return Err(BoundaryError::Inconsistent { last });
            }
        }

        let complete = if last == 0 {
            self.ranges.is_empty()
        } else {
            self.ranges.is_complete_through(last)
        };
        if !complete {
            return Err(BoundaryError::Inconsistent { last });
        }

        self.last = Some(last);
        Ok(())
    }

    /// Mark the sequence terminated; false if the boundary is still unknown
    pub fn terminate(&mut self) -> bool {
        if self.last.is_none() {
            return false;
        }
        self.terminated = true;
        true
    }

    /// Whether the ranges are exactly `[1, last]`
    pub fn all_added(&self) -> bool {
        match self.last {
            Some(0) => self.ranges.is_empty(),
            Some(last) => self.ranges.is_complete_through(last),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v11() -> ReliableInputConnection {
        ReliableInputConnection::new(ProtocolVersion::WsReliableMessaging11, 128)
    }

    fn feb() -> ReliableInputConnection {
        ReliableInputConnection::new(ProtocolVersion::WsrmFebruary2005, 128)
    }

    #[test]
    fn test_gap_then_redelivery() {
        let mut input = v11();
        assert!(!input.merge(1, false));
        assert!(!input.merge(3, false));
        assert_eq!(input.ranges().len(), 2);

        input.set_close_sequence_last(3).unwrap();
        assert!(!input.all_added());

        assert!(input.merge(2, false));
        assert_eq!(input.ranges().to_string(), "{[1-3]}");
    }

    #[test]
    fn test_boundary_rejects_higher_numbers() {
        let mut input = v11();
        input.merge(1, false);
        input.set_close_sequence_last(2).unwrap();

        assert!(input.is_valid(2, false));
        assert!(!input.is_valid(3, false));
        assert!(input.is_sequence_closed());
    }

    #[test]
    fn test_small_close_last_is_rejected() {
        let mut input = v11();
        input.merge(5, false);
        assert_eq!(
            input.set_close_sequence_last(4),
            Err(BoundaryError::SmallLastNumber { last: 4, highest: 5 })
        );
        assert!(!input.is_sequence_closed());
    }

    #[test]
    fn test_terminate_requires_all_messages() {
        let mut input = v11();
        input.merge(1, false);
        input.merge(3, false);
        assert_eq!(
            input.set_terminate_sequence_last(3),
            Err(BoundaryError::Inconsistent { last: 3 })
        );

        input.merge(2, false);
        input.set_terminate_sequence_last(3).unwrap();
        assert!(input.terminate());
    }

    #[test]
    fn test_early_terminate() {
        let mut input = feb();
        input.merge(1, false);
        assert!(!input.terminate());
        assert!(!input.is_terminated());
    }

    #[test]
    fn test_last_message_marker() {
        let mut input = feb();
        input.merge(4, false);
        assert!(!input.is_valid(3, true));
        assert!(!input.is_valid(4, true));

        assert!(!input.merge(5, true));
        assert_eq!(input.last(), Some(5));
        assert!(!input.is_valid(6, false));
        assert!(!input.is_valid(5, false));
        assert!(input.is_valid(4, false));
        assert!(!input.is_valid(4, true));
        assert!(input.is_valid(5, true));

        for n in 1..=3 {
            input.merge(n, false);
        }
        assert!(input.all_added());
        assert!(input.terminate());
    }

    #[test]
    fn test_can_merge_bounded_by_range_count() {
        let mut input = ReliableInputConnection::new(ProtocolVersion::WsReliableMessaging11, 2);
        input.merge(1, false);
        input.merge(5, false);

        assert!(input.can_merge(2));
        assert!(input.can_merge(5));
        assert!(!input.can_merge(9));
    }

    #[test]
    fn test_empty_sequence_closed_at_zero() {
        let mut input = v11();
        input.set_close_sequence_last(0).unwrap();
        assert!(input.all_added());
        input.set_terminate_sequence_last(0).unwrap();
        assert!(input.terminate());
    }

    #[test]
    fn test_number_zero_invalid() {
        assert!(!v11().is_valid(0, false));
    }
}
