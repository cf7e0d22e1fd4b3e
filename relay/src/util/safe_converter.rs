//! Numeric conversions between the wire's fixed-width fields and `usize` buffer arithmetic.

/// Widening casts that can never lose information
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u32> for u16 {
    fn safe_cast(self) -> u32 {
        self as u32
    }
}

/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prechecked_in_range() {
        let len: u16 = 65535usize.prechecked_cast();
        assert_eq!(len, u16::MAX);
        let seq_delta: u32 = 1400usize.prechecked_cast();
        assert_eq!(seq_delta, 1400);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: u16 = 65536usize.prechecked_cast();
    }

    #[test]
    fn test_safe_cast() {
        let n: usize = 0xffffu16.safe_cast();
        assert_eq!(n, 0xffff);
        let n: usize = 0xffff_ffffu32.safe_cast();
        assert_eq!(n, 0xffff_ffff);
    }
}
