//! Comparison of 16-bit sequence numbers with wrap-around semantics.
//!
//! Sequence numbers are compared by their forward distance mod 2^16: `a` is greater than `b` if
//!  it lies at most half the number space ahead of `b`. This keeps window logic correct while the
//!  counters cycle through 65535 -> 0.

const HALF_RANGE: u16 = 32768;

pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    (s1 > s2 && s1 - s2 <= HALF_RANGE) ||
        (s1 < s2 && s2 - s1 > HALF_RANGE)
}

pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// `s1 >= s2` with wrap-around semantics
pub fn sequence_greater_equal(s1: u16, s2: u16) -> bool {
    s1 == s2 || sequence_greater_than(s1, s2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(5, 5, false, false)]
    #[case::simple_greater(6, 5, true, false)]
    #[case::simple_less(5, 6, false, true)]
    #[case::wrap_greater(0, 65535, true, false)]
    #[case::wrap_less(65535, 0, false, true)]
    #[case::wrap_far(10, 65000, true, false)]
    #[case::half_range_greater(32768, 0, true, false)]
    #[case::half_range_less(0, 32768, false, true)]
    #[case::just_over_half(32769, 0, false, true)]
    #[case::max_zero(0, 0, false, false)]
    fn test_compare(#[case] a: u16, #[case] b: u16, #[case] greater: bool, #[case] less: bool) {
        assert_eq!(sequence_greater_than(a, b), greater);
        assert_eq!(sequence_less_than(a, b), less);
        assert_eq!(sequence_greater_equal(a, b), greater || a == b);
    }

    #[test]
    fn test_exactly_one_relation_holds() {
        for a in (0..=u16::MAX).step_by(97) {
            for b in (0..=u16::MAX).step_by(89) {
                let relations = [a == b, sequence_greater_than(a, b), sequence_less_than(a, b)];
                assert_eq!(relations.iter().filter(|r| **r).count(), 1, "a={} b={}", a, b);
            }
        }
    }
}
