use std::fmt::{Display, Formatter};

/// Position of a frame in the ordered traffic of one connection. It is transmitted as a
///  signed 32-bit integer and is non-negative in practice.
///
/// NB: There is no wrap-around handling: a connection that sends more than `i32::MAX`
///      ordered frames starts over at negative numbers, which receivers treat as stale
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SequenceNumber(i32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: i32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> i32 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    /// all sequence numbers from `self` (inclusive) to `end` (exclusive)
    pub fn to(&self, end: SequenceNumber) -> impl Iterator<Item = SequenceNumber> {
        (self.0..end.0).map(SequenceNumber)
    }
}
