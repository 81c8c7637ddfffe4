use crate::error::Error;
use crate::header::MAX_ALLOCATION_SIZE;
use crate::value::{TypeCode, Value};
use crate::vm::{ObjRef, Vm};

/// Most slots a fixed-length array can hold.
const MAX_CAPACITY: usize = MAX_ALLOCATION_SIZE / 2;

/// Backing capacity after growing `capacity` to fit `needed` slots.
fn grown_capacity(capacity: usize, needed: usize) -> usize {
    let grown = (2 * capacity).max(needed).max(4);
    if grown > MAX_CAPACITY && needed <= MAX_CAPACITY {
        MAX_CAPACITY
    } else {
        grown
    }
}

impl Vm<'_> {
    pub fn new_array(&mut self) -> Result<Value, Error> {
        self.new_array_with_capacity(0)
    }

    pub(crate) fn new_array_with_capacity(&mut self, capacity: usize) -> Result<Value, Error> {
        let ptr = self.allocate(4, TypeCode::Array)?;
        self.heap.set_slot(ptr, 0, Value::Null);
        self.heap.set_slot(ptr, 1, Value::Int(0));
        let array = Value::Ptr(ptr);
        if capacity == 0 {
            return Ok(array);
        }
        self.rooted(&[array], |vm, base| {
            let data = vm.allocate_slots(capacity, TypeCode::FixedLengthArray, Value::Deleted)?;
            let Value::Ptr(array) = vm.scratch[base] else {
                return Err(Error::Corrupt("array left the heap"));
            };
            vm.heap.set_slot(array, 0, Value::Ptr(data));
            Ok(vm.scratch[base])
        })
    }

    pub(crate) fn new_fixed_array(&mut self, length: usize, fill: Value) -> Result<Value, Error> {
        let ptr = self.allocate_slots(length, TypeCode::FixedLengthArray, fill)?;
        Ok(Value::Ptr(ptr))
    }

    pub(crate) fn array_length(&self, array: ObjRef) -> usize {
        match self.slot_of(array, 1) {
            Value::Int(length) if length >= 0 => length as usize,
            _ => 0,
        }
    }

    fn array_capacity(&self, array: ObjRef) -> usize {
        self.obj_ref(self.slot_of(array, 0))
            .map_or(0, |data| self.slot_count_of(data))
    }

    /// Element `index`; holes and out-of-range reads give `undefined`.
    pub(crate) fn array_element(&self, array: ObjRef, index: usize) -> Value {
        if index >= self.array_length(array) {
            return Value::Undefined;
        }
        match self.obj_ref(self.slot_of(array, 0)) {
            Some(data) if index < self.slot_count_of(data) => match self.slot_of(data, index) {
                Value::Deleted => Value::Undefined,
                value => self.resolve_handle(value),
            },
            _ => Value::Undefined,
        }
    }

    /// Make room for `needed` elements, reallocating the backing store.
    fn array_reserve(&mut self, array: Value, needed: usize) -> Result<(), Error> {
        let obj = self.obj_ref(array).ok_or(Error::TypeError("not an array"))?;
        let capacity = self.array_capacity(obj);
        if needed <= capacity {
            return Ok(());
        }
        if matches!(obj, ObjRef::Rom(_)) {
            return Err(Error::TypeError("cannot grow a read-only array"));
        }
        let new_capacity = grown_capacity(capacity, needed);
        self.rooted(&[array], |vm, base| {
            let data =
                vm.allocate_slots(new_capacity, TypeCode::FixedLengthArray, Value::Deleted)?;
            let Value::Ptr(array) = vm.scratch[base] else {
                return Err(Error::Corrupt("array left the heap"));
            };
            let length = vm.array_length(ObjRef::Heap(array));
            if let Value::Ptr(old) = vm.heap.slot(array, 0) {
                let keep = length.min(vm.heap.slot_count(old));
                for i in 0..keep {
                    let value = vm.heap.slot(old, i);
                    vm.heap.set_slot(data, i, value);
                }
            }
            vm.heap.set_slot(array, 0, Value::Ptr(data));
            log::trace!("array at {:#06x} grown to {new_capacity} slots", array.0);
            Ok(())
        })
    }

    /// `array[index] = value`, growing the array as needed.
    pub(crate) fn array_set(&mut self, array: Value, index: usize, value: Value) -> Result<(), Error> {
        self.rooted(&[array, value], |vm, base| {
            vm.array_reserve(vm.scratch[base], index + 1)?;
            let obj = vm
                .obj_ref(vm.scratch[base])
                .ok_or(Error::TypeError("not an array"))?;
            let data = vm
                .obj_ref(vm.slot_of(obj, 0))
                .ok_or(Error::Corrupt("array without backing store"))?;
            vm.set_slot_of(data, index, vm.scratch[base + 1])?;
            if index >= vm.array_length(obj) {
                vm.set_slot_of(obj, 1, Value::Int((index + 1) as i16))?;
            }
            Ok(())
        })
    }

    fn array_set_length(&mut self, array: Value, length: usize) -> Result<(), Error> {
        self.rooted(&[array], |vm, base| {
            let obj = vm
                .obj_ref(vm.scratch[base])
                .ok_or(Error::TypeError("not an array"))?;
            let current = vm.array_length(obj);
            if length < current {
                if let Some(data) = vm.obj_ref(vm.slot_of(obj, 0)) {
                    for i in length..current.min(vm.slot_count_of(data)) {
                        vm.set_slot_of(data, i, Value::Deleted)?;
                    }
                }
            } else if length > current {
                vm.array_reserve(vm.scratch[base], length)?;
            }
            let obj = vm
                .obj_ref(vm.scratch[base])
                .ok_or(Error::TypeError("not an array"))?;
            vm.set_slot_of(obj, 1, Value::Int(length as i16))
        })
    }

    pub fn array_push(&mut self, array: Value, value: Value) -> Result<(), Error> {
        let obj = self
            .object_of_type(array, TypeCode::Array)
            .ok_or(Error::TypeError("not an array"))?;
        let length = self.array_length(obj);
        self.array_set(self.resolve_handle(array), length, value)
    }

    /// Indexed store on arrays, fixed-length arrays and byte arrays.
    pub(crate) fn set_indexed(
        &mut self,
        object: Value,
        code: TypeCode,
        key: Value,
        value: Value,
    ) -> Result<(), Error> {
        match (code, key) {
            (_, Value::Int(index)) if index < 0 => Err(Error::RangeError("negative array index")),
            (TypeCode::Array, Value::Int(index)) => self.array_set(object, index as usize, value),
            (TypeCode::Array, Value::StrLength) => match value {
                Value::Int(length) if length >= 0 => self.array_set_length(object, length as usize),
                _ => Err(Error::RangeError("invalid array length")),
            },
            (TypeCode::Array, Value::StrProto) => {
                Err(Error::TypeError("the prototype of an array is read-only"))
            }
            (TypeCode::FixedLengthArray, Value::Int(index)) => {
                let obj = self.obj_ref(object).ok_or(Error::TypeError("not an array"))?;
                if index as usize >= self.slot_count_of(obj) {
                    return Err(Error::RangeError("index out of range"));
                }
                self.set_slot_of(obj, index as usize, value)
            }
            (TypeCode::Uint8Array, Value::Int(index)) => {
                let byte = self.to_int32(value) as u8;
                let Value::Ptr(ptr) = object else {
                    return Err(Error::TypeError("cannot write to a read-only object"));
                };
                let body = self.heap.body_mut(ptr);
                let slot = body
                    .get_mut(index as usize)
                    .ok_or(Error::RangeError("index out of range"))?;
                *slot = byte;
                Ok(())
            }
            _ => Err(Error::TypeError("invalid array index")),
        }
    }

    pub fn new_uint8_array(&mut self, bytes: &[u8]) -> Result<Value, Error> {
        let ptr = self.allocate(bytes.len(), TypeCode::Uint8Array)?;
        self.heap.body_mut(ptr).copy_from_slice(bytes);
        Ok(Value::Ptr(ptr))
    }

    pub fn uint8_array_bytes(&self, value: Value) -> Result<&[u8], Error> {
        let obj = self
            .object_of_type(value, TypeCode::Uint8Array)
            .ok_or(Error::TypeError("not a Uint8Array"))?;
        Ok(self.body_of(obj))
    }
}
