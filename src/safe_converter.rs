//! Integer conversions between wire-level widths (`u8` / `u16`) and `usize` buffer arithmetic.

/// Widening conversion, lossless on every supported target.
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u8 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// For narrowing casts where a preceding length / range check guarantees the value fits, e.g.
///  a fragment index that was validated against `max_fragments <= 256`.
///
/// NB: Panics if the check was missing, since that is a bug rather than bad input
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: length should have been checked against u16 range")
    }
}

impl PrecheckedCast<u8> for usize {
    fn prechecked_cast(self) -> u8 {
        self.try_into().expect("this is a bug: length should have been checked against u8 range")
    }
}
