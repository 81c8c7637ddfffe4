//! Value: the 16-bit runtime datum.
//!
//! On the wire (heap bytes, image bytes) every value is a little-endian `u16`:
//!
//! ```text
//! xxxx xxxx xxxx xxx0   short pointer into the live heap
//! xxxx xxxx xxxx xx11   14-bit signed integer
//! xxxx xxxx xxxx xx01   well-known constant (raw < 0x29)
//! xxxx xxxx xxxx xx01   bytecode-mapped pointer (raw >= 0x29, offset = raw & !3)
//! ```
//!
//! In Rust a value is the closed enum [`Value`]; the packed form only
//! exists at the storage boundary ([`Value::encode`] / [`Value::decode`]).
use std::fmt;

pub const INT14_MIN: i32 = -0x2000;
pub const INT14_MAX: i32 = 0x1FFF;

/// Raw encodings of the well-known constants.
pub mod raw {
    pub const UNDEFINED: u16 = 0x01;
    pub const NULL: u16 = 0x05;
    pub const TRUE: u16 = 0x09;
    pub const FALSE: u16 = 0x0D;
    pub const NAN: u16 = 0x11;
    pub const NEG_ZERO: u16 = 0x15;
    pub const DELETED: u16 = 0x19;
    pub const STR_LENGTH: u16 = 0x1D;
    pub const STR_PROTO: u16 = 0x21;
    pub const NO_OP_FUNCTION: u16 = 0x25;
    /// First raw value that is a bytecode-mapped pointer rather than a
    /// well-known constant.
    pub const WELL_KNOWN_END: u16 = 0x29;
}

/// Byte offset of an allocation body in the live heap. Always even and
/// never zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapPtr(pub u16);

/// Byte offset of an allocation body (or of a global slot, for handles)
/// in the bytecode image. Always a multiple of 4.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RomPtr(pub u16);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// 14-bit signed integer.
    Int(i16),
    Ptr(HeapPtr),
    Rom(RomPtr),
    Undefined,
    Null,
    True,
    False,
    NaN,
    NegZero,
    /// Array hole sentinel, also "callback accepted" in the async protocol.
    Deleted,
    /// The interned string `"length"`.
    StrLength,
    /// The interned string `"__proto__"`.
    StrProto,
    NoOpFunction,
}

impl Value {
    pub const ZERO: Value = Value::Int(0);

    /// Decode a stored 16-bit value. Total: every bit pattern maps to a
    /// variant, validity of pointers is checked by the loader and the GC.
    #[inline]
    pub fn decode(raw: u16) -> Value {
        if raw & 1 == 0 {
            return Value::Ptr(HeapPtr(raw));
        }
        if raw & 3 == 3 {
            return Value::Int((raw as i16) >> 2);
        }
        match raw {
            raw::UNDEFINED => Value::Undefined,
            raw::NULL => Value::Null,
            raw::TRUE => Value::True,
            raw::FALSE => Value::False,
            raw::NAN => Value::NaN,
            raw::NEG_ZERO => Value::NegZero,
            raw::DELETED => Value::Deleted,
            raw::STR_LENGTH => Value::StrLength,
            raw::STR_PROTO => Value::StrProto,
            raw::NO_OP_FUNCTION => Value::NoOpFunction,
            _ => Value::Rom(RomPtr(raw & !3)),
        }
    }

    #[inline]
    pub fn encode(self) -> u16 {
        match self {
            Value::Int(i) => ((i as u16) << 2) | 3,
            Value::Ptr(HeapPtr(p)) => p,
            Value::Rom(RomPtr(p)) => p | 1,
            Value::Undefined => raw::UNDEFINED,
            Value::Null => raw::NULL,
            Value::True => raw::TRUE,
            Value::False => raw::FALSE,
            Value::NaN => raw::NAN,
            Value::NegZero => raw::NEG_ZERO,
            Value::Deleted => raw::DELETED,
            Value::StrLength => raw::STR_LENGTH,
            Value::StrProto => raw::STR_PROTO,
            Value::NoOpFunction => raw::NO_OP_FUNCTION,
        }
    }

    /// Int14 if `value` fits, `None` otherwise.
    #[inline]
    pub fn int14(value: i32) -> Option<Value> {
        if (INT14_MIN..=INT14_MAX).contains(&value) {
            Some(Value::Int(value as i16))
        } else {
            None
        }
    }

    #[inline]
    pub fn from_bool(b: bool) -> Value {
        if b { Value::True } else { Value::False }
    }

    #[inline]
    pub fn is_short_ptr(self) -> bool {
        matches!(self, Value::Ptr(_))
    }

    #[inline]
    pub fn is_int14(self) -> bool {
        matches!(self, Value::Int(_))
    }

    /// Bytecode-mapped pointer or well-known constant (the `01` tag).
    #[inline]
    pub fn is_rom_or_well_known(self) -> bool {
        !matches!(self, Value::Ptr(_) | Value::Int(_))
    }

    #[inline]
    pub fn as_int(self) -> Option<i16> {
        match self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_heap(self) -> Option<HeapPtr> {
        match self {
            Value::Ptr(p) => Some(p),
            _ => None,
        }
    }

    #[inline]
    pub fn is_nullish(self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Ptr(HeapPtr(p)) => write!(f, "heap@{p:#06x}"),
            Value::Rom(RomPtr(p)) => write!(f, "rom@{p:#06x}"),
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::True => f.write_str("true"),
            Value::False => f.write_str("false"),
            Value::NaN => f.write_str("NaN"),
            Value::NegZero => f.write_str("-0"),
            Value::Deleted => f.write_str("<deleted>"),
            Value::StrLength => f.write_str("\"length\""),
            Value::StrProto => f.write_str("\"__proto__\""),
            Value::NoOpFunction => f.write_str("<no-op>"),
        }
    }
}

/// Type codes. The low 16 are the allocation header nibble, the rest only
/// appear as the result of a deep type query on a non-pointer value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeCode {
    /// Reserved, never valid in a live heap.
    Tombstone = 0x0,
    Int32 = 0x1,
    Float64 = 0x2,
    String = 0x3,
    InternedString = 0x4,
    /// Bytecode function, ROM only.
    Function = 0x5,
    HostFunc = 0x6,
    Uint8Array = 0x7,
    Symbol = 0x8,
    Class = 0x9,
    Virtual = 0xA,
    Reserved = 0xB,
    PropertyList = 0xC,
    Array = 0xD,
    FixedLengthArray = 0xE,
    Closure = 0xF,

    Int14 = 0x10,
    Undefined = 0x11,
    Null = 0x12,
    True = 0x13,
    False = 0x14,
    NaN = 0x15,
    NegZero = 0x16,
    Deleted = 0x17,
    StrLength = 0x18,
    StrProto = 0x19,
    NoOpFunction = 0x1A,
}

impl TypeCode {
    /// Map the 4-bit header nibble to its type code.
    pub fn from_header_bits(bits: u8) -> TypeCode {
        match bits & 0xF {
            0x0 => TypeCode::Tombstone,
            0x1 => TypeCode::Int32,
            0x2 => TypeCode::Float64,
            0x3 => TypeCode::String,
            0x4 => TypeCode::InternedString,
            0x5 => TypeCode::Function,
            0x6 => TypeCode::HostFunc,
            0x7 => TypeCode::Uint8Array,
            0x8 => TypeCode::Symbol,
            0x9 => TypeCode::Class,
            0xA => TypeCode::Virtual,
            0xB => TypeCode::Reserved,
            0xC => TypeCode::PropertyList,
            0xD => TypeCode::Array,
            0xE => TypeCode::FixedLengthArray,
            _ => TypeCode::Closure,
        }
    }

    /// Type code of a value that is not a pointer.
    pub fn of_immediate(value: Value) -> Option<TypeCode> {
        Some(match value {
            Value::Int(_) => TypeCode::Int14,
            Value::Undefined => TypeCode::Undefined,
            Value::Null => TypeCode::Null,
            Value::True => TypeCode::True,
            Value::False => TypeCode::False,
            Value::NaN => TypeCode::NaN,
            Value::NegZero => TypeCode::NegZero,
            Value::Deleted => TypeCode::Deleted,
            Value::StrLength => TypeCode::StrLength,
            Value::StrProto => TypeCode::StrProto,
            Value::NoOpFunction => TypeCode::NoOpFunction,
            Value::Ptr(_) | Value::Rom(_) => return None,
        })
    }

    /// Whether allocations of this type are made of value slots the GC
    /// and the loader have to visit.
    pub fn is_container(self) -> bool {
        matches!(
            self,
            TypeCode::PropertyList
                | TypeCode::Array
                | TypeCode::FixedLengthArray
                | TypeCode::Closure
                | TypeCode::Class
        )
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            TypeCode::String
                | TypeCode::InternedString
                | TypeCode::StrLength
                | TypeCode::StrProto
        )
    }

    pub fn is_number(self) -> bool {
        matches!(
            self,
            TypeCode::Int14 | TypeCode::Int32 | TypeCode::Float64 | TypeCode::NaN | TypeCode::NegZero
        )
    }

    /// Header codes a well-formed heap may contain.
    pub fn is_valid_heap_type(self) -> bool {
        !matches!(
            self,
            TypeCode::Tombstone
                | TypeCode::Function
                | TypeCode::Symbol
                | TypeCode::Virtual
                | TypeCode::Reserved
        ) && (self as u8) < 0x10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int14_roundtrip_extremes() {
        for i in [INT14_MIN, -1, 0, 1, 42, INT14_MAX] {
            let v = Value::int14(i).expect("in range");
            assert_eq!(Value::decode(v.encode()), v, "int14 {i}");
            assert_eq!(v.as_int(), Some(i as i16));
        }
        assert_eq!(Value::int14(INT14_MAX + 1), None);
        assert_eq!(Value::int14(INT14_MIN - 1), None);
    }

    #[test]
    fn int14_raw_layout() {
        assert_eq!(Value::Int(0).encode(), 0b11);
        assert_eq!(Value::Int(1).encode(), 0b111);
        assert_eq!(Value::Int(-1).encode(), 0xFFFF);
    }

    #[test]
    fn well_known_constants_decode() {
        let all = [
            Value::Undefined,
            Value::Null,
            Value::True,
            Value::False,
            Value::NaN,
            Value::NegZero,
            Value::Deleted,
            Value::StrLength,
            Value::StrProto,
            Value::NoOpFunction,
        ];
        for (n, v) in all.iter().enumerate() {
            assert_eq!(v.encode(), ((n as u16) << 2) | 1);
            assert_eq!(Value::decode(v.encode()), *v);
            assert!(v.is_rom_or_well_known());
        }
    }

    #[test]
    fn rom_pointer_above_well_known_range() {
        let v = Value::decode(0x2C | 1);
        assert_eq!(v, Value::Rom(RomPtr(0x2C)));
        assert_eq!(v.encode(), 0x2D);
        assert!(!v.is_short_ptr());
    }

    #[test]
    fn short_pointer_is_even() {
        let v = Value::decode(0x0124);
        assert_eq!(v, Value::Ptr(HeapPtr(0x124)));
        assert!(v.is_short_ptr());
        assert_eq!(v.encode(), 0x124);
    }

    #[test]
    fn header_nibble_mapping_is_total() {
        for bits in 0u8..16 {
            assert_eq!(TypeCode::from_header_bits(bits) as u8, bits);
        }
        assert!(TypeCode::PropertyList.is_container());
        assert!(!TypeCode::String.is_container());
        assert!(!TypeCode::Tombstone.is_valid_heap_type());
    }
}
