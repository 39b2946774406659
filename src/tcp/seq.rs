use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::ops::{Add, AddAssign, Sub, SubAssign};

// "It is essential to remember that the actual sequence number space is
// finite, though very large. This space ranges from 0 to 2**32 - 1." rfc9293

/// A TCP sequence number.
///
/// Comparison is defined on the signed distance between two numbers, so any
/// two values less than 2^31 apart order correctly across the wrap. Values
/// exactly 2^31 apart both compare `Less` than each other: the order is only
/// total over a set spanning less than 2^31, which every ordered collection
/// keyed by it must keep to (see [`SequenceNumber32::in_window`]).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SequenceNumber32(u32);

impl SequenceNumber32 {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub fn max(self, other: Self) -> Self {
        if self >= other {
            self
        } else {
            other
        }
    }

    pub fn min(self, other: Self) -> Self {
        if self <= other {
            self
        } else {
            other
        }
    }

    /// True when `self` is `base` or ahead of it by less than 2^31.
    pub fn in_window(self, base: Self) -> bool {
        self.0.wrapping_sub(base.0) < 1 << 31
    }

    /// Bytes from `self` up to `end`, or 0 when `end` is not ahead.
    pub fn distance_to(self, end: Self) -> u32 {
        let diff = end - self;
        if diff > 0 {
            diff as u32
        } else {
            0
        }
    }
}

impl Ord for SequenceNumber32 {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0.wrapping_sub(other.0) as i32).cmp(&0)
    }
}

impl PartialOrd for SequenceNumber32 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<u32> for SequenceNumber32 {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber32> for u32 {
    fn from(seq: SequenceNumber32) -> Self {
        seq.0
    }
}

impl Add<u32> for SequenceNumber32 {
    type Output = Self;

    fn add(self, rhs: u32) -> Self {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SequenceNumber32 {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for SequenceNumber32 {
    type Output = Self;

    fn sub(self, rhs: u32) -> Self {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u32> for SequenceNumber32 {
    fn sub_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

impl Sub for SequenceNumber32 {
    type Output = i32;

    fn sub(self, rhs: Self) -> i32 {
        self.0.wrapping_sub(rhs.0) as i32
    }
}

impl Display for SequenceNumber32 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SequenceNumber32 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

#[cfg(test)]
mod seq_tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 2, Ordering::Less)]
    #[case(2, 1, Ordering::Greater)]
    #[case(7, 7, Ordering::Equal)]
    #[case(u32::MAX, 0, Ordering::Less)]
    #[case(0, u32::MAX, Ordering::Greater)]
    #[case(u32::MAX - 10, 20, Ordering::Less)]
    #[case(0x7fff_ffff, 0, Ordering::Greater)]
    #[case(0x8000_0001, 0, Ordering::Less)]
    fn test_seq_compare(#[case] a: u32, #[case] b: u32, #[case] expected: Ordering) {
        let a = SequenceNumber32::new(a);
        let b = SequenceNumber32::new(b);
        assert_eq!(a.cmp(&b), expected);
        assert_eq!(b.cmp(&a), expected.reverse());
    }

    #[rstest]
    #[case(0, 0, true)]
    #[case(0x7fff_ffff, 0, true)]
    #[case(0x8000_0000, 0, false)]
    #[case(5, u32::MAX - 5, true)]
    #[case(0, 1, false)]
    fn test_seq_in_window(#[case] seq: u32, #[case] base: u32, #[case] expected: bool) {
        let seq = SequenceNumber32::new(seq);
        let base = SequenceNumber32::new(base);
        assert_eq!(seq.in_window(base), expected);
        if expected {
            assert!(seq >= base);
        }
    }

    #[test]
    fn test_seq_order_breaks_at_half_space() {
        // Outside the window both directions compare Less.
        let a = SequenceNumber32::new(0);
        let b = SequenceNumber32::new(0x8000_0000);
        assert_eq!(a.cmp(&b), Ordering::Less);
        assert_eq!(b.cmp(&a), Ordering::Less);
        assert!(!b.in_window(a));
        assert!(!a.in_window(b));
    }

    #[rstest]
    #[case(u32::MAX - 1, 3, 1)]
    #[case(100, 50, 150)]
    #[case(u32::MAX, 1, 0)]
    fn test_seq_arithmetic(#[case] start: u32, #[case] len: u32, #[case] expected_end: u32) {
        let start = SequenceNumber32::new(start);
        let end = start + len;
        assert_eq!(end.value(), expected_end);
        assert_eq!(end - start, len as i32);
        assert_eq!(start - end, -(len as i32));
        assert_eq!(end - len, start);
        assert!(start < end);
        assert_eq!(start.distance_to(end), len);
        assert_eq!(end.distance_to(start), 0);
    }

    #[test]
    fn test_seq_min_max_across_wrap() {
        let before = SequenceNumber32::new(u32::MAX - 5);
        let after = SequenceNumber32::new(4);
        assert_eq!(before.max(after), after);
        assert_eq!(before.min(after), before);
        let mut s = before;
        s += 10;
        assert_eq!(s, after);
        s -= 10;
        assert_eq!(s, before);
    }
}
