use crate::error::Error;
use crate::image::format::Builtin;
use crate::value::{TypeCode, Value};
use crate::vm::{ObjRef, Vm};

/// Prototype chains longer than this are treated as cyclic.
const MAX_PROTO_DEPTH: usize = 256;

impl Vm<'_> {
    pub fn new_object(&mut self) -> Result<Value, Error> {
        self.new_object_with_proto(Value::Null)
    }

    pub(crate) fn new_object_with_proto(&mut self, proto: Value) -> Result<Value, Error> {
        self.rooted(&[proto], |vm, base| {
            let ptr = vm.allocate(4, TypeCode::PropertyList)?;
            vm.heap.set_slot(ptr, 0, Value::Null);
            vm.heap.set_slot(ptr, 1, vm.scratch[base]);
            Ok(Value::Ptr(ptr))
        })
    }

    /// Promises reuse their first pair as internal state.
    pub(crate) fn is_promise(&self, head: ObjRef) -> bool {
        let proto = self.builtin(Builtin::PromiseProto);
        !proto.is_nullish()
            && self.slot_count_of(head) >= 4
            && self.resolve_handle(self.slot_of(head, 1)) == self.resolve_handle(proto)
    }

    fn next_segment(&self, segment: ObjRef) -> Option<ObjRef> {
        self.obj_ref(self.slot_of(segment, 0))
    }

    /// Slot holding the value for `key` in the object's own segments.
    fn find_own(&self, head: ObjRef, key: Value) -> Option<(ObjRef, usize)> {
        let mut segment = Some(head);
        while let Some(current) = segment {
            let count = self.slot_count_of(current);
            for key_slot in (2..count.saturating_sub(1)).step_by(2) {
                if self.slot_of(current, key_slot) == key {
                    return Some((current, key_slot + 1));
                }
            }
            segment = self.next_segment(current);
        }
        None
    }

    /// Look `key` up on a property list and its prototype chain.
    fn lookup(&self, object: Value, key: Value) -> Value {
        let mut current = object;
        for _ in 0..MAX_PROTO_DEPTH {
            let Some(head) = self.object_of_type(current, TypeCode::PropertyList) else {
                return Value::Undefined;
            };
            if let Some((segment, slot)) = self.find_own(head, key) {
                return self.resolve_handle(self.slot_of(segment, slot));
            }
            current = self.slot_of(head, 1);
        }
        Value::Undefined
    }

    fn object_ref(&self, object: Value) -> Result<ObjRef, Error> {
        self.obj_ref(object).ok_or(Error::TypeError("not an object"))
    }

    /// `object[key]`. Never allocates: a string key that was never
    /// interned cannot name a property.
    pub fn get_property(&self, object: Value, key: Value) -> Result<Value, Error> {
        let object = self.resolve_handle(object);
        let code = self.deep_type_of(object);
        if matches!(code, TypeCode::Undefined | TypeCode::Null) {
            return Err(Error::TypeError("cannot read properties of null or undefined"));
        }
        let Some(key) = self.find_property_key(key)? else {
            return Ok(Value::Undefined);
        };
        match code {
            TypeCode::PropertyList => match key {
                Value::StrProto => Ok(self.resolve_handle(self.slot_of(self.object_ref(object)?, 1))),
                _ => Ok(self.lookup(object, key)),
            },
            TypeCode::Array => {
                let array = self.object_ref(object)?;
                match key {
                    Value::Int(index) if index < 0 => Err(Error::RangeError("negative array index")),
                    Value::Int(index) => Ok(self.array_element(array, index as usize)),
                    Value::StrLength => Ok(Value::Int(self.array_length(array) as i16)),
                    Value::StrProto => Ok(self.resolve_handle(self.builtin(Builtin::ArrayProto))),
                    _ => Ok(self.lookup(self.builtin(Builtin::ArrayProto), key)),
                }
            }
            TypeCode::FixedLengthArray => {
                let array = self.object_ref(object)?;
                let count = self.slot_count_of(array);
                match key {
                    Value::Int(index) if index >= 0 && (index as usize) < count => {
                        Ok(self.slot_of(array, index as usize))
                    }
                    Value::Int(_) => Err(Error::RangeError("index out of range")),
                    Value::StrLength => Ok(Value::Int(count as i16)),
                    _ => Ok(Value::Undefined),
                }
            }
            TypeCode::Uint8Array => {
                let bytes = self.uint8_array_bytes(object)?;
                match key {
                    Value::Int(index) if index >= 0 && (index as usize) < bytes.len() => {
                        Ok(Value::Int(bytes[index as usize] as i16))
                    }
                    Value::Int(_) => Err(Error::RangeError("index out of range")),
                    Value::StrLength => Ok(Value::Int(bytes.len() as i16)),
                    _ => Ok(Value::Undefined),
                }
            }
            TypeCode::Class => {
                let class = self.object_ref(object)?;
                self.get_property(self.slot_of(class, 1), key)
            }
            code if code.is_string() => match key {
                Value::StrLength => Ok(Value::Int(self.string_length(object) as i16)),
                Value::StrProto => Ok(self.resolve_handle(self.builtin(Builtin::StrProto))),
                _ => Ok(self.lookup(self.builtin(Builtin::StrProto), key)),
            },
            _ => Ok(Value::Undefined),
        }
    }

    /// `object[key] = value`. May allocate.
    pub fn set_property(&mut self, object: Value, key: Value, value: Value) -> Result<(), Error> {
        let object = self.resolve_handle(object);
        match self.deep_type_of(object) {
            TypeCode::Undefined | TypeCode::Null => {
                Err(Error::TypeError("cannot set properties of null or undefined"))
            }
            code @ (TypeCode::Array | TypeCode::FixedLengthArray | TypeCode::Uint8Array) => {
                let key = self
                    .find_property_key(key)?
                    .ok_or(Error::TypeError("invalid array index"))?;
                self.set_indexed(object, code, key, value)
            }
            TypeCode::PropertyList => self.rooted(&[object, value], |vm, base| {
                let key = vm.property_key(key)?;
                vm.set_own(vm.scratch[base], key, vm.scratch[base + 1])
            }),
            TypeCode::Class => {
                let statics = self.slot_of(self.object_ref(object)?, 1);
                self.set_property(statics, key, value)
            }
            _ => Err(Error::TypeError("cannot set a property on a primitive")),
        }
    }

    /// Set an own property of a property list. `key` is canonical.
    fn set_own(&mut self, object: Value, key: Value, value: Value) -> Result<(), Error> {
        let head = self.object_ref(object)?;
        if key == Value::StrProto {
            return self.set_prototype(head, object, value);
        }
        if let Some((segment, slot)) = self.find_own(head, key) {
            return self.set_slot_of(segment, slot, value);
        }
        if matches!(head, ObjRef::Rom(_)) {
            return Err(Error::TypeError("cannot add a property to a read-only object"));
        }
        self.rooted(&[object, key, value], |vm, base| {
            let segment = vm.allocate(8, TypeCode::PropertyList)?;
            vm.heap.set_slot(segment, 0, Value::Null);
            vm.heap.set_slot(segment, 1, Value::Null);
            vm.heap.set_slot(segment, 2, vm.scratch[base + 1]);
            vm.heap.set_slot(segment, 3, vm.scratch[base + 2]);
            let Value::Ptr(mut last) = vm.scratch[base] else {
                return Err(Error::Corrupt("property list left the heap"));
            };
            while let Value::Ptr(next) = vm.heap.slot(last, 0) {
                last = next;
            }
            vm.heap.set_slot(last, 0, Value::Ptr(segment));
            Ok(())
        })
    }

    fn set_prototype(&mut self, head: ObjRef, object: Value, proto: Value) -> Result<(), Error> {
        let proto = self.resolve_handle(proto);
        if proto != Value::Null && self.deep_type_of(proto) != TypeCode::PropertyList {
            return Err(Error::TypeError("prototype must be an object or null"));
        }
        let mut current = proto;
        for _ in 0..MAX_PROTO_DEPTH {
            if current == object {
                return Err(Error::TypeError("cyclic __proto__ value"));
            }
            match self.object_of_type(current, TypeCode::PropertyList) {
                Some(obj) => current = self.resolve_handle(self.slot_of(obj, 1)),
                None => break,
            }
        }
        self.set_slot_of(head, 1, proto)
    }

    /// Own keys in insertion order, as a new array. Promise state is not a key.
    pub(crate) fn own_keys(&mut self, object: Value) -> Result<Value, Error> {
        let object = self.resolve_handle(object);
        let keys: Vec<Value> = match self.deep_type_of(object) {
            TypeCode::PropertyList => {
                let head = self.object_ref(object)?;
                let skip_first = self.is_promise(head);
                let mut keys = Vec::new();
                let mut segment = Some(head);
                while let Some(current) = segment {
                    let count = self.slot_count_of(current);
                    for key_slot in (2..count.saturating_sub(1)).step_by(2) {
                        if skip_first && current == head && key_slot == 2 {
                            continue;
                        }
                        keys.push(self.slot_of(current, key_slot));
                    }
                    segment = self.next_segment(current);
                }
                keys
            }
            TypeCode::Array => {
                let array = self.object_ref(object)?;
                (0..self.array_length(array))
                    .map(|i| Value::Int(i as i16))
                    .collect()
            }
            _ => return Err(Error::TypeError("Object.keys called on a non-object")),
        };
        let count = keys.len();
        self.rooted(&keys, |vm, base| {
            let array = vm.new_array_with_capacity(count)?;
            vm.rooted(&[array], |vm, array_slot| {
                for i in 0..count {
                    vm.array_set(vm.scratch[array_slot], i, vm.scratch[base + i])?;
                }
                Ok(vm.scratch[array_slot])
            })
        })
    }
}
