use crate::value::TypeCode;

/// Largest body an allocation header can describe.
pub const MAX_ALLOCATION_SIZE: usize = 0x0FFF;

/// Bit 11 of a function header's size field marks a continuation.
pub const CONTINUATION_FLAG: u16 = 0x0800;

/// Functions are limited by the width of the non-continuation size field.
pub const MAX_FUNCTION_SIZE: usize = 0x07FF;

/// Allocation header: `[type:4 | size:12]`, stored little-endian right
/// before the allocation body.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header(pub u16);

impl Header {
    #[inline]
    pub fn new(type_code: TypeCode, size: usize) -> Self {
        debug_assert!((type_code as u8) < 0x10);
        debug_assert!(size <= MAX_ALLOCATION_SIZE);
        Header(((type_code as u16) << 12) | size as u16)
    }

    /// Header of a continuation embedded in a function. `back_offset` is the
    /// distance from the function body to the continuation body in bytes.
    pub fn continuation(back_offset: usize) -> Self {
        debug_assert!(back_offset % 4 == 0);
        Header(((TypeCode::Function as u16) << 12) | CONTINUATION_FLAG | (back_offset / 4) as u16)
    }

    #[inline]
    pub fn type_code(self) -> TypeCode {
        TypeCode::from_header_bits((self.0 >> 12) as u8)
    }

    #[inline]
    pub fn size(self) -> usize {
        (self.0 & 0x0FFF) as usize
    }

    #[inline]
    pub fn is_continuation(self) -> bool {
        self.type_code() == TypeCode::Function && self.0 & CONTINUATION_FLAG != 0
    }

    /// Bytes from the parent function body to this continuation's body.
    #[inline]
    pub fn continuation_back_offset(self) -> usize {
        ((self.0 & 0x07FF) as usize) * 4
    }

    /// Bytes the allocation occupies in the heap, header included.
    #[inline]
    pub fn footprint(self) -> usize {
        footprint(self.size())
    }
}

#[inline]
pub fn footprint(size: usize) -> usize {
    2 + ((size + 1) & !1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_type_and_size() {
        let h = Header::new(TypeCode::PropertyList, 12);
        assert_eq!(h.0, 0xC00C);
        assert_eq!(h.type_code(), TypeCode::PropertyList);
        assert_eq!(h.size(), 12);
        assert_eq!(h.footprint(), 14);
    }

    #[test]
    fn odd_sizes_round_up() {
        assert_eq!(Header::new(TypeCode::String, 5).footprint(), 8);
        assert_eq!(Header::new(TypeCode::String, 0).footprint(), 2);
    }

    #[test]
    fn continuation_header_roundtrip() {
        let h = Header::continuation(24);
        assert!(h.is_continuation());
        assert_eq!(h.continuation_back_offset(), 24);
        assert!(!Header::new(TypeCode::Function, 24).is_continuation());
    }
}
