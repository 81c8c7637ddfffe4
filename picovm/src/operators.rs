//! Conversions and the arithmetic, bitwise and comparison operators.
//!
//! Integer operands stay on an i32 path with checked overflow and fall
//! back to f64 only when a result leaves that range. Results always go
//! through [`Vm::new_number`], which picks the smallest encoding.
use crate::bytecode::op::{BitOp, NumOp};
use crate::error::Error;
use crate::value::{TypeCode, Value};
use crate::vm::{Vm, ValueType};

/// Equality class of a value for strict comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Reference,
    Identity,
    Number,
    String,
    NeverEqual,
}

fn category(code: TypeCode) -> Category {
    match code {
        TypeCode::Int14 | TypeCode::Int32 | TypeCode::Float64 | TypeCode::NegZero => {
            Category::Number
        }
        TypeCode::String
        | TypeCode::InternedString
        | TypeCode::StrLength
        | TypeCode::StrProto => Category::String,
        TypeCode::NaN => Category::NeverEqual,
        TypeCode::Undefined
        | TypeCode::Null
        | TypeCode::True
        | TypeCode::False
        | TypeCode::Deleted
        | TypeCode::NoOpFunction => Category::Identity,
        _ => Category::Reference,
    }
}

/// ECMAScript ToInt32 of a double.
pub(crate) fn f64_to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let wrapped = n.trunc().rem_euclid(4_294_967_296.0);
    wrapped as u64 as u32 as i32
}

/// JS-style number formatting.
pub(crate) fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_owned();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_owned();
    }
    if n == 0.0 {
        return "0".to_owned();
    }
    let abs = n.abs();
    if abs >= 1e21 || abs < 1e-6 {
        // Rust prints `1e21`, JS prints `1e+21`.
        let s = format!("{n:e}");
        return match s.find('e') {
            Some(at) if !s[at + 1..].starts_with('-') => format!("{}e+{}", &s[..at], &s[at + 1..]),
            _ => s,
        };
    }
    if n.fract() == 0.0 {
        format!("{n:.0}")
    } else {
        format!("{n}")
    }
}

fn parse_number(text: &str) -> f64 {
    let text = text.trim();
    match text {
        "" => return 0.0,
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_or(f64::NAN, |n| n as f64);
    }
    if !text
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return f64::NAN;
    }
    text.parse().unwrap_or(f64::NAN)
}

impl Vm<'_> {
    pub fn new_boolean(&self, b: bool) -> Value {
        Value::from_bool(b)
    }

    pub fn new_int32(&mut self, i: i32) -> Result<Value, Error> {
        if let Some(value) = Value::int14(i) {
            return Ok(value);
        }
        let ptr = self.allocate(4, TypeCode::Int32)?;
        self.heap.body_mut(ptr).copy_from_slice(&i.to_le_bytes());
        Ok(Value::Ptr(ptr))
    }

    pub fn new_number(&mut self, n: f64) -> Result<Value, Error> {
        if n.is_nan() {
            return Ok(Value::NaN);
        }
        if n == 0.0 && n.is_sign_negative() {
            return Ok(Value::NegZero);
        }
        if n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64 {
            return self.new_int32(n as i32);
        }
        let ptr = self.allocate(8, TypeCode::Float64)?;
        self.heap.body_mut(ptr).copy_from_slice(&n.to_le_bytes());
        Ok(Value::Ptr(ptr))
    }

    /// The value as an i32, if it is stored as an integer.
    fn as_i32(&self, value: Value) -> Option<i32> {
        match value {
            Value::Int(i) => Some(i as i32),
            _ => {
                let obj = self.object_of_type(value, TypeCode::Int32)?;
                let bytes = self.body_of(obj).get(..4)?;
                Some(i32::from_le_bytes(bytes.try_into().ok()?))
            }
        }
    }

    fn boxed_f64(&self, value: Value) -> Option<f64> {
        let obj = self.object_of_type(value, TypeCode::Float64)?;
        let bytes = self.body_of(obj).get(..8)?;
        Some(f64::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn to_f64(&self, value: Value) -> f64 {
        match value {
            Value::Int(i) => i as f64,
            Value::NaN | Value::Undefined | Value::Deleted => f64::NAN,
            Value::NegZero => -0.0,
            Value::Null | Value::False => 0.0,
            Value::True => 1.0,
            _ => {
                if let Some(i) = self.as_i32(value) {
                    i as f64
                } else if let Some(n) = self.boxed_f64(value) {
                    n
                } else if let Some(bytes) = self.string_bytes(value) {
                    parse_number(&String::from_utf8_lossy(bytes))
                } else {
                    f64::NAN
                }
            }
        }
    }

    pub fn to_int32(&self, value: Value) -> i32 {
        match self.as_i32(value) {
            Some(i) => i,
            None => f64_to_int32(self.to_f64(value)),
        }
    }

    pub fn to_bool(&self, value: Value) -> bool {
        match value {
            Value::Int(i) => i != 0,
            Value::True | Value::StrLength | Value::StrProto | Value::NoOpFunction => true,
            Value::False
            | Value::Undefined
            | Value::Null
            | Value::NaN
            | Value::NegZero
            | Value::Deleted => false,
            _ => match self.deep_type_of(value) {
                TypeCode::Int32 => self.as_i32(value) != Some(0),
                TypeCode::Float64 => self.boxed_f64(value).is_some_and(|n| n != 0.0 && !n.is_nan()),
                TypeCode::String | TypeCode::InternedString => {
                    self.string_bytes(value).is_some_and(|bytes| !bytes.is_empty())
                }
                _ => true,
            },
        }
    }

    pub fn is_nan(&self, value: Value) -> bool {
        match self.deep_type_of(value) {
            TypeCode::NaN => true,
            TypeCode::Float64 => self.boxed_f64(value).is_some_and(f64::is_nan),
            _ => false,
        }
    }

    /// Strict equality (`===`).
    pub fn equal(&self, a: Value, b: Value) -> bool {
        let (a, b) = (self.resolve_handle(a), self.resolve_handle(b));
        let (ca, cb) = (
            category(self.deep_type_of(a)),
            category(self.deep_type_of(b)),
        );
        if ca != cb {
            return false;
        }
        match ca {
            Category::NeverEqual => false,
            Category::Reference | Category::Identity => a == b,
            Category::Number => {
                if let (Value::Int(x), Value::Int(y)) = (a, b) {
                    return x == y;
                }
                self.to_f64(a) == self.to_f64(b)
            }
            Category::String => a == b || self.string_bytes(a) == self.string_bytes(b),
        }
    }

    pub fn type_of(&self, value: Value) -> ValueType {
        match self.deep_type_of(value) {
            TypeCode::Undefined | TypeCode::Deleted => ValueType::Undefined,
            TypeCode::Null => ValueType::Null,
            TypeCode::True | TypeCode::False => ValueType::Boolean,
            TypeCode::Int14
            | TypeCode::Int32
            | TypeCode::Float64
            | TypeCode::NaN
            | TypeCode::NegZero => ValueType::Number,
            TypeCode::String
            | TypeCode::InternedString
            | TypeCode::StrLength
            | TypeCode::StrProto => ValueType::String,
            TypeCode::Function
            | TypeCode::HostFunc
            | TypeCode::Closure
            | TypeCode::NoOpFunction => ValueType::Function,
            TypeCode::Array => ValueType::Array,
            TypeCode::Uint8Array => ValueType::Uint8Array,
            TypeCode::Class => ValueType::Class,
            _ => ValueType::Object,
        }
    }

    /// Result of the `typeof` operator.
    pub(crate) fn typeof_name(&self, value: Value) -> &'static str {
        match self.type_of(value) {
            ValueType::Undefined => "undefined",
            ValueType::Boolean => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Function | ValueType::Class => "function",
            ValueType::Null | ValueType::Object | ValueType::Array | ValueType::Uint8Array => {
                "object"
            }
        }
    }

    pub fn value_to_string(&self, value: Value) -> String {
        if let Some(bytes) = self.string_bytes(value) {
            return String::from_utf8_lossy(bytes).into_owned();
        }
        match value {
            Value::Int(i) => return i.to_string(),
            Value::NegZero => return "0".to_owned(),
            _ => {}
        }
        match self.type_of(value) {
            ValueType::Undefined => "undefined".to_owned(),
            ValueType::Null => "null".to_owned(),
            ValueType::Boolean => (value == Value::True).to_string(),
            ValueType::Number => number_to_string(self.to_f64(value)),
            ValueType::Function | ValueType::Class => "[Function]".to_owned(),
            ValueType::Array => "[object Array]".to_owned(),
            ValueType::Uint8Array => "[object Uint8Array]".to_owned(),
            ValueType::String | ValueType::Object => "[object Object]".to_owned(),
        }
    }

    /// `a + b`: string concatenation if either side is a string.
    pub(crate) fn add(&mut self, a: Value, b: Value) -> Result<Value, Error> {
        if self.is_string(a) || self.is_string(b) {
            return self.concat(a, b);
        }
        self.add_numbers(a, b)
    }

    fn add_numbers(&mut self, a: Value, b: Value) -> Result<Value, Error> {
        if let (Value::Int(x), Value::Int(y)) = (a, b)
            && (0..0x1000).contains(&x)
            && (0..0x1000).contains(&y)
        {
            return Ok(Value::Int(x + y));
        }
        if let (Some(x), Some(y)) = (self.as_i32(a), self.as_i32(b))
            && let Some(sum) = x.checked_add(y)
        {
            return self.new_int32(sum);
        }
        self.new_number(self.to_f64(a) + self.to_f64(b))
    }

    pub(crate) fn num_op(&mut self, op: NumOp, a: Value, b: Value) -> Result<Value, Error> {
        let ints = self.as_i32(a).zip(self.as_i32(b));
        match op {
            NumOp::Less | NumOp::Greater | NumOp::LessEqual | NumOp::GreaterEqual => {
                let ordering = match ints {
                    Some((x, y)) => Some(x.cmp(&y)),
                    None => self.to_f64(a).partial_cmp(&self.to_f64(b)),
                };
                let result = ordering.is_some_and(|ord| match op {
                    NumOp::Less => ord.is_lt(),
                    NumOp::Greater => ord.is_gt(),
                    NumOp::LessEqual => ord.is_le(),
                    _ => ord.is_ge(),
                });
                Ok(Value::from_bool(result))
            }
            NumOp::AddNum => self.add_numbers(a, b),
            NumOp::Subtract => match ints.and_then(|(x, y)| x.checked_sub(y)) {
                Some(diff) => self.new_int32(diff),
                None => self.new_number(self.to_f64(a) - self.to_f64(b)),
            },
            NumOp::Multiply => match ints {
                Some((x, y)) => match x.checked_mul(y) {
                    Some(0) if x < 0 || y < 0 => Ok(Value::NegZero),
                    Some(product) => self.new_int32(product),
                    None => self.new_number(x as f64 * y as f64),
                },
                None => self.new_number(self.to_f64(a) * self.to_f64(b)),
            },
            NumOp::Divide => self.new_number(self.to_f64(a) / self.to_f64(b)),
            NumOp::DivideAndTrunc => {
                let quotient = self.to_f64(a) / self.to_f64(b);
                self.new_int32(f64_to_int32(quotient))
            }
            NumOp::Remainder => match ints {
                Some((_, 0)) => Ok(Value::NaN),
                Some((x, y)) => match x.checked_rem(y).unwrap_or(0) {
                    0 if x < 0 => Ok(Value::NegZero),
                    rem => self.new_int32(rem),
                },
                None => self.new_number(self.to_f64(a) % self.to_f64(b)),
            },
            NumOp::Power => {
                let (x, y) = (self.to_f64(a), self.to_f64(b));
                let result = if y.is_nan() || (x.abs() == 1.0 && y.is_infinite()) {
                    f64::NAN
                } else {
                    x.powf(y)
                };
                self.new_number(result)
            }
            NumOp::Negate => match a {
                Value::Int(0) => Ok(Value::NegZero),
                Value::Int(i) => self.new_int32(-(i as i32)),
                _ => self.new_number(-self.to_f64(a)),
            },
            NumOp::UnaryPlus => match a {
                Value::Int(_) => Ok(a),
                _ => self.new_number(self.to_f64(a)),
            },
        }
    }

    pub(crate) fn bit_op(&mut self, op: BitOp, a: Value, b: Value) -> Result<Value, Error> {
        let x = self.to_int32(a);
        let y = if op.is_unary() { 0 } else { self.to_int32(b) };
        let shift = (y & 31) as u32;
        let result = match op {
            BitOp::ShrArithmetic => x >> shift,
            BitOp::ShrLogical => {
                let wide = (x as u32) >> shift;
                return match i32::try_from(wide) {
                    Ok(i) => self.new_int32(i),
                    Err(_) => self.new_number(wide as f64),
                };
            }
            BitOp::Shl => x.wrapping_shl(shift),
            BitOp::Or => x | y,
            BitOp::And => x & y,
            BitOp::Xor => x ^ y,
            BitOp::Not => !x,
        };
        self.new_int32(result)
    }

    /// The `typeof` string as a value, reusing an interned copy if any.
    pub(crate) fn typeof_value(&mut self, value: Value) -> Result<Value, Error> {
        let name = self.typeof_name(value);
        match self.find_interned(name.as_bytes()) {
            Some(interned) => Ok(interned),
            None => self.new_string(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::builder::ImageBuilder;

    fn with_vm(f: impl FnOnce(&mut Vm<'_>)) {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        f(&mut vm);
    }

    #[test]
    fn int32_overflow_widens_to_float() {
        with_vm(|vm| {
            let max = vm.new_int32(i32::MAX).unwrap();
            let sum = vm.num_op(NumOp::AddNum, max, Value::Int(1)).unwrap();
            assert_eq!(vm.deep_type_of(sum), TypeCode::Float64);
            assert_eq!(vm.to_f64(sum), 2147483648.0);
        });
    }

    #[test]
    fn small_sums_stay_int14() {
        with_vm(|vm| {
            assert_eq!(vm.add(Value::Int(2), Value::Int(3)).unwrap(), Value::Int(5));
            let big = vm.add(Value::Int(8000), Value::Int(8000)).unwrap();
            assert_eq!(vm.deep_type_of(big), TypeCode::Int32);
            assert_eq!(vm.to_int32(big), 16000);
        });
    }

    #[test]
    fn negative_zero_behaviour() {
        with_vm(|vm| {
            assert!(vm.equal(Value::NegZero, Value::Int(0)));
            let inf = vm.num_op(NumOp::Divide, Value::Int(1), Value::NegZero).unwrap();
            assert_eq!(vm.to_f64(inf), f64::NEG_INFINITY);
            let product = vm.num_op(NumOp::Multiply, Value::Int(-3), Value::Int(0)).unwrap();
            assert_eq!(product, Value::NegZero);
            let rem = vm.num_op(NumOp::Remainder, Value::Int(-4), Value::Int(2)).unwrap();
            assert_eq!(rem, Value::NegZero);
            assert_eq!(vm.num_op(NumOp::Negate, Value::Int(0), Value::Undefined).unwrap(), Value::NegZero);
        });
    }

    #[test]
    fn nan_is_never_equal() {
        with_vm(|vm| {
            assert!(!vm.equal(Value::NaN, Value::NaN));
            let nan = vm.num_op(NumOp::Divide, Value::Int(0), Value::Int(0)).unwrap();
            assert_eq!(nan, Value::NaN);
            assert!(vm.is_nan(nan));
            assert_eq!(vm.num_op(NumOp::Remainder, Value::Int(5), Value::Int(0)).unwrap(), Value::NaN);
        });
    }

    #[test]
    fn unsigned_shift_of_negative_widens() {
        with_vm(|vm| {
            let r = vm.bit_op(BitOp::ShrLogical, Value::Int(-1), Value::Int(0)).unwrap();
            assert_eq!(vm.to_f64(r), 4294967295.0);
            assert_eq!(vm.bit_op(BitOp::Not, Value::Int(0), Value::Undefined).unwrap(), Value::Int(-1));
            assert_eq!(vm.bit_op(BitOp::Shl, Value::Int(1), Value::Int(33)).unwrap(), Value::Int(2));
        });
    }

    #[test]
    fn to_int32_wraps() {
        assert_eq!(f64_to_int32(4294967296.0 + 5.0), 5);
        assert_eq!(f64_to_int32(-1.5), -1);
        assert_eq!(f64_to_int32(2147483648.0), i32::MIN);
        assert_eq!(f64_to_int32(f64::INFINITY), 0);
    }

    #[test]
    fn number_formatting() {
        assert_eq!(number_to_string(2.0), "2");
        assert_eq!(number_to_string(4000000000.0), "4000000000");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn strings_compare_by_content() {
        with_vm(|vm| {
            let a = vm.new_string("abc").unwrap();
            let b = vm.new_string("abc").unwrap();
            assert_ne!(a, b);
            assert!(vm.equal(a, b));
            assert!(!vm.equal(a, Value::Int(0)));
            let obj = vm.new_object().unwrap();
            assert!(vm.equal(obj, obj));
            assert!(!vm.equal(Value::Null, Value::Undefined));
        });
    }

    #[test]
    fn truthiness_and_parsing() {
        with_vm(|vm| {
            let empty = vm.new_string("").unwrap();
            let zero = vm.new_string(" 12 ").unwrap();
            assert!(!vm.to_bool(empty));
            assert!(vm.to_bool(zero));
            assert_eq!(vm.to_f64(zero), 12.0);
            assert!(!vm.to_bool(Value::NegZero));
            assert!(vm.to_f64(Value::Undefined).is_nan());
            assert_eq!(parse_number("0x1F"), 31.0);
            assert!(parse_number("inf").is_nan());
        });
    }
}
