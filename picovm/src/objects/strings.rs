use crate::error::Error;
use crate::value::{TypeCode, Value};
use crate::vm::Vm;

impl Vm<'_> {
    pub fn new_string(&mut self, s: &str) -> Result<Value, Error> {
        self.new_string_bytes(s.as_bytes())
    }

    pub(crate) fn new_string_bytes(&mut self, bytes: &[u8]) -> Result<Value, Error> {
        let ptr = self.allocate(bytes.len(), TypeCode::String)?;
        self.heap.body_mut(ptr).copy_from_slice(bytes);
        Ok(Value::Ptr(ptr))
    }

    /// UTF-8 bytes of a string value, `None` for anything else.
    pub(crate) fn string_bytes(&self, value: Value) -> Option<&[u8]> {
        match value {
            Value::StrLength => Some(b"length"),
            Value::StrProto => Some(b"__proto__"),
            _ => {
                let obj = self.obj_ref(value)?;
                if self.header_of(obj).type_code().is_string() {
                    Some(self.body_of(obj))
                } else {
                    None
                }
            }
        }
    }

    pub fn is_string(&self, value: Value) -> bool {
        self.deep_type_of(value).is_string()
    }

    /// JS `length` of a string: UTF-16 code units.
    pub(crate) fn string_length(&self, value: Value) -> usize {
        match self.string_bytes(value) {
            Some(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => s.encode_utf16().count(),
                Err(_) => bytes.len(),
            },
            None => 0,
        }
    }

    /// `a + b` where at least one side is a string.
    pub(crate) fn concat(&mut self, a: Value, b: Value) -> Result<Value, Error> {
        let mut joined = self.value_to_string(a);
        joined.push_str(&self.value_to_string(b));
        self.new_string(&joined)
    }
}

#[cfg(test)]
mod tests {
    use crate::image::builder::ImageBuilder;
    use crate::value::Value;
    use crate::vm::Vm;

    #[test]
    fn length_counts_utf16_units() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let s = vm.new_string("héllo😀").unwrap();
        assert_eq!(vm.string_length(s), 7);
        assert_eq!(vm.string_length(Value::StrLength), 6);
    }

    #[test]
    fn concat_formats_numbers() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let a = vm.new_string("n=").unwrap();
        let joined = vm.concat(a, Value::Int(42)).unwrap();
        assert_eq!(vm.value_to_string(joined), "n=42");
    }
}
