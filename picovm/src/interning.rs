//! Property key canonicalisation.
//!
//! Property lists compare keys by their encoded value, so every string key
//! must be reduced to one canonical value first: `"length"` and
//! `"__proto__"` become well-known constants, small integer strings
//! become int14 keys, and everything else resolves to the single
//! interned copy of the string. Interned strings come from the image's
//! sorted string table or from the runtime intern list, a chain of
//! `[next, string]` cells whose head lives in the global named by the
//! `InternedStrings` builtin. The runtime list is weak; the collector
//! rebuilds it from the cells whose string survived.
use crate::error::Error;
use crate::header::Header;
use crate::image::format::{Builtin, Section, read_u16};
use crate::value::{INT14_MAX, INT14_MIN, RomPtr, TypeCode, Value};
use crate::vm::{ObjRef, Vm};

/// Int key for a canonical integer string within int14, so that `o[-3]`
/// and `o["-3"]` name the same property. `"-0"` stays a string.
fn canonical_index(bytes: &[u8]) -> Option<Value> {
    let (negative, digits) = match bytes {
        [b'-', rest @ ..] => (true, rest),
        _ => (false, bytes),
    };
    if digits.is_empty() || digits.len() > 4 || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return None;
    }
    let n = digits
        .iter()
        .fold(0i32, |acc, &digit| acc * 10 + (digit - b'0') as i32);
    let n = if negative { -n } else { n };
    let in_range = if negative {
        n != 0 && n >= INT14_MIN
    } else {
        n <= INT14_MAX
    };
    in_range.then_some(Value::Int(n as i16))
}

/// Keys that never need a table lookup.
pub(crate) fn immediate_key(bytes: &[u8]) -> Option<Value> {
    match bytes {
        b"length" => Some(Value::StrLength),
        b"__proto__" => Some(Value::StrProto),
        _ => canonical_index(bytes),
    }
}

impl Vm<'_> {
    /// Global slot holding the runtime intern list head.
    pub(crate) fn intern_list_global(&self) -> Option<usize> {
        match self.builtin(Builtin::InternedStrings) {
            Value::Rom(ptr) => self.handle_global_index(ptr),
            _ => None,
        }
    }

    fn intern_list_head(&self) -> Value {
        self.intern_list_global()
            .and_then(|index| self.globals.get(index).copied())
            .unwrap_or(Value::Null)
    }

    /// Binary search the image string table.
    fn find_rom_string(&self, bytes: &[u8]) -> Option<Value> {
        let table = self.header.section_range(Section::StringTable);
        let (mut lo, mut hi) = (0, table.len() / 2);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let offset = read_u16(self.image, table.start + 2 * mid) as usize;
            let candidate = self.body_of(ObjRef::Rom(offset));
            match candidate.cmp(bytes) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(Value::Rom(RomPtr(offset as u16))),
            }
        }
        None
    }

    fn find_runtime_string(&self, bytes: &[u8]) -> Option<Value> {
        let mut cell = self.intern_list_head();
        while let Value::Ptr(ptr) = cell {
            let string = self.heap.slot(ptr, 1);
            if self.string_bytes(string) == Some(bytes) {
                return Some(string);
            }
            cell = self.heap.slot(ptr, 0);
        }
        None
    }

    /// Canonical key for `bytes` if one already exists.
    pub(crate) fn find_interned(&self, bytes: &[u8]) -> Option<Value> {
        immediate_key(bytes)
            .or_else(|| self.find_rom_string(bytes))
            .or_else(|| self.find_runtime_string(bytes))
    }

    /// Canonical key for `value` without allocating. `Ok(None)` means the
    /// key was never interned, so no object can have it.
    pub(crate) fn find_property_key(&self, value: Value) -> Result<Option<Value>, Error> {
        match value {
            Value::Int(_) | Value::StrLength | Value::StrProto => return Ok(Some(value)),
            _ => {}
        }
        match self.deep_type_of(value) {
            TypeCode::InternedString => {
                let value = self.resolve_handle(value);
                Ok(Some(
                    self.string_bytes(value)
                        .and_then(immediate_key)
                        .unwrap_or(value),
                ))
            }
            TypeCode::String => Ok(self
                .string_bytes(value)
                .and_then(|bytes| self.find_interned(bytes))),
            code if code.is_container() || code == TypeCode::Uint8Array => {
                Err(Error::TypeError("invalid property key"))
            }
            _ => {
                let text = self.value_to_string(value);
                Ok(self.find_interned(text.as_bytes()))
            }
        }
    }

    /// Canonical key for `value`, interning it on a miss. May allocate.
    pub(crate) fn property_key(&mut self, value: Value) -> Result<Value, Error> {
        if let Some(key) = self.find_property_key(value)? {
            return Ok(key);
        }
        let value = self.resolve_handle(value);
        match value {
            Value::Ptr(ptr) if self.heap.header(ptr).type_code() == TypeCode::String => {
                self.intern_heap_string(value)
            }
            _ => {
                // Image strings and primitives get a heap copy first.
                let text = self.value_to_string(value);
                let copy = self.new_string(&text)?;
                self.intern_heap_string(copy)
            }
        }
    }

    /// Mark a heap string interned and link it into the runtime list. The
    /// caller has checked that no equal string is interned yet.
    fn intern_heap_string(&mut self, string: Value) -> Result<Value, Error> {
        let head_global = self
            .intern_list_global()
            .ok_or(Error::Corrupt("intern list builtin is not a handle"))?;
        self.rooted(&[string], |vm, base| {
            let cell = vm.allocate(4, TypeCode::FixedLengthArray)?;
            let string = vm.scratch[base];
            let Value::Ptr(ptr) = string else {
                return Err(Error::Corrupt("interned string moved out of the heap"));
            };
            let size = vm.heap.header(ptr).size();
            vm.heap.set_header(ptr, Header::new(TypeCode::InternedString, size));
            vm.heap.set_slot(cell, 0, vm.globals[head_global]);
            vm.heap.set_slot(cell, 1, string);
            vm.globals[head_global] = Value::Ptr(cell);
            log::trace!("interned runtime string at {string}");
            Ok(string)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::builder::ImageBuilder;

    #[test]
    fn canonical_indices() {
        assert_eq!(canonical_index(b"0"), Some(Value::Int(0)));
        assert_eq!(canonical_index(b"8191"), Some(Value::Int(8191)));
        assert_eq!(canonical_index(b"8192"), None);
        assert_eq!(canonical_index(b"01"), None);
        assert_eq!(canonical_index(b"-1"), Some(Value::Int(-1)));
        assert_eq!(canonical_index(b"-8192"), Some(Value::Int(-8192)));
        assert_eq!(canonical_index(b"-8193"), None);
        assert_eq!(canonical_index(b"-0"), None);
        assert_eq!(canonical_index(b"-"), None);
        assert_eq!(canonical_index(b"--1"), None);
        assert_eq!(canonical_index(b""), None);
    }

    #[test]
    fn image_strings_are_found_by_content() {
        let mut b = ImageBuilder::new();
        b.string("beta");
        let alpha = b.string("alpha");
        b.string("gamma");
        b.export(1, alpha);
        let image = b.build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let alpha = vm.resolve_export(1).unwrap();
        let copy = vm.new_string("alpha").unwrap();
        assert_eq!(vm.property_key(copy).unwrap(), alpha);
        assert_eq!(vm.find_interned(b"delta"), None);
    }

    #[test]
    fn runtime_interning_reuses_the_first_copy() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let first = vm.new_string("fresh").unwrap();
        let key = vm.property_key(first).unwrap();
        assert_eq!(key, first);
        assert_eq!(vm.deep_type_of(key), TypeCode::InternedString);
        let second = vm.new_string("fresh").unwrap();
        assert_eq!(vm.property_key(second).unwrap(), first);
    }

    #[test]
    fn special_keys() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let length = vm.new_string("length").unwrap();
        assert_eq!(vm.property_key(length).unwrap(), Value::StrLength);
        let index = vm.new_string("12").unwrap();
        assert_eq!(vm.property_key(index).unwrap(), Value::Int(12));
        assert_eq!(vm.property_key(Value::Int(-3)).unwrap(), Value::Int(-3));
        let negative = vm.new_string("-3").unwrap();
        assert_eq!(vm.property_key(negative).unwrap(), Value::Int(-3));
    }

    #[test]
    fn image_integer_strings_are_integer_keys() {
        let mut b = ImageBuilder::new();
        let negative = b.string("-3");
        let index = b.string("12");
        b.export(1, negative);
        b.export(2, index);
        let image = b.build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let negative = vm.resolve_export(1).unwrap();
        let index = vm.resolve_export(2).unwrap();
        assert_eq!(vm.property_key(negative).unwrap(), Value::Int(-3));
        assert_eq!(vm.property_key(index).unwrap(), Value::Int(12));
        assert_eq!(vm.value_to_string(index), "12");
    }

    #[test]
    fn object_literal_integer_keys_are_found_by_index() {
        let mut b = ImageBuilder::new();
        let seven = b.string("7");
        let rom = b.rom_object(Value::Null.into(), &[(seven, Value::Int(1).into())]);
        let heap = b.heap_object(Value::Null.into(), &[(seven, Value::Int(2).into())]);
        b.export(1, rom);
        let heap_global = b.global(heap) as usize;
        let image = b.build();
        let vm = Vm::restore(&image, |_| None).unwrap();
        let rom = vm.resolve_export(1).unwrap();
        assert_eq!(vm.get_property(rom, Value::Int(7)).unwrap(), Value::Int(1));
        let heap = vm.global(heap_global).unwrap();
        assert_eq!(vm.get_property(heap, Value::Int(7)).unwrap(), Value::Int(2));
    }

    #[test]
    fn integer_and_string_keys_name_one_property() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let object = vm.new_object().unwrap();
        let object = vm.new_handle(object);
        let o = vm.handle_value(&object).unwrap();
        vm.set_property(o, Value::Int(-3), Value::Int(1)).unwrap();
        let text = vm.new_string("-3").unwrap();
        let o = vm.handle_value(&object).unwrap();
        assert_eq!(vm.get_property(o, text).unwrap(), Value::Int(1));
        vm.set_property(o, text, Value::Int(2)).unwrap();
        let o = vm.handle_value(&object).unwrap();
        assert_eq!(vm.get_property(o, Value::Int(-3)).unwrap(), Value::Int(2));
        let keys = vm.own_keys(o).unwrap();
        assert_eq!(vm.get_property(keys, Value::StrLength).unwrap(), Value::Int(1));
    }

    #[test]
    fn unreferenced_interned_strings_are_dropped() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let s = vm.new_string("transient").unwrap();
        vm.property_key(s).unwrap();
        assert!(vm.find_interned(b"transient").is_some());
        vm.collect_garbage(false);
        assert_eq!(vm.find_interned(b"transient"), None);
        assert_eq!(vm.heap.used(), 0);
    }
}
