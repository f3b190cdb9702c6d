//! Sequence numbers for parcel ordering.

use core::fmt;
use core::ops::{Add, AddAssign};

/// A 64-bit sequence number within one direction of one route.
///
/// Each direction of each route carries an independent numbering starting at
/// zero. Comparisons are total; the counter never wraps in practice.
///
/// A `SequenceNumber` doubles as a sequence *length*: the length of the
/// prefix `[0, n)` is the number `n` itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[must_use]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const ZERO: Self = Self(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// The sequence number immediately after this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Add<u64> for SequenceNumber {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for SequenceNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_total() {
        assert!(SequenceNumber(0) < SequenceNumber(1));
        assert!(SequenceNumber(41) < SequenceNumber(42));
        assert_eq!(SequenceNumber(7), SequenceNumber(7));
    }

    #[test]
    fn test_next_and_add() {
        assert_eq!(SequenceNumber(0).next(), SequenceNumber(1));
        assert_eq!(SequenceNumber(10) + 5, SequenceNumber(15));
        let mut n = SequenceNumber(3);
        n += 4;
        assert_eq!(n, SequenceNumber(7));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", SequenceNumber(1234)), "1234");
    }
}
