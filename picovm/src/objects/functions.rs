use crate::error::Error;
use crate::value::{TypeCode, Value};
use crate::vm::{ObjRef, Vm};

/// What a call instruction ends up invoking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Callee {
    /// Bytecode entry. `function` is the body offset of the function that
    /// owns the code, `pc` where execution starts (the first instruction,
    /// or a resume point inside the function).
    Bytecode {
        function: usize,
        pc: usize,
        closure: Value,
    },
    /// Index into the import table.
    Host(usize),
    NoOp,
}

impl Vm<'_> {
    /// Entry point of an image function or continuation at `offset`.
    fn rom_entry(&self, offset: usize) -> Result<(usize, usize), Error> {
        let header = self.rom_header(offset);
        if header.type_code() != TypeCode::Function {
            return Err(Error::TypeError("value is not a function"));
        }
        if header.is_continuation() {
            let function = offset
                .checked_sub(header.continuation_back_offset())
                .ok_or(Error::Corrupt("continuation before its function"))?;
            Ok((function, offset))
        } else {
            Ok((offset, offset + 1))
        }
    }

    fn host_import_index(&self, obj: ObjRef) -> Result<usize, Error> {
        let index = match self.body_of(obj) {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]) as usize,
            _ => return Err(Error::Corrupt("host function body too short")),
        };
        if index >= self.imports.len() {
            return Err(Error::Corrupt("host function index out of range"));
        }
        Ok(index)
    }

    pub(crate) fn resolve_callee(&self, target: Value) -> Result<Callee, Error> {
        let target = self.resolve_handle(target);
        if target == Value::NoOpFunction {
            return Ok(Callee::NoOp);
        }
        let obj = self
            .obj_ref(target)
            .ok_or(Error::TypeError("value is not a function"))?;
        match (self.header_of(obj).type_code(), obj) {
            (TypeCode::Function, ObjRef::Rom(offset)) => {
                let (function, pc) = self.rom_entry(offset)?;
                Ok(Callee::Bytecode {
                    function,
                    pc,
                    closure: Value::Undefined,
                })
            }
            (TypeCode::HostFunc, _) => Ok(Callee::Host(self.host_import_index(obj)?)),
            (TypeCode::Closure, _) if self.slot_count_of(obj) > 0 => {
                let inner = self.slot_of(obj, 0);
                if self.deep_type_of(inner) == TypeCode::Closure {
                    return Err(Error::TypeError("closure target is a closure"));
                }
                match self.resolve_callee(inner)? {
                    Callee::Bytecode { function, pc, .. } => Ok(Callee::Bytecode {
                        function,
                        pc,
                        closure: target,
                    }),
                    other => Ok(other),
                }
            }
            _ => Err(Error::TypeError("value is not a function")),
        }
    }

    /// Maximum operand stack depth declared by a function.
    pub(crate) fn max_stack_depth(&self, function: usize) -> usize {
        self.image.get(function).copied().unwrap_or(0) as usize
    }

    /// `[target, scope]` closure over the active scope.
    pub(crate) fn new_closure(&mut self, target: Value, scope: Value) -> Result<Value, Error> {
        self.rooted(&[target, scope], |vm, base| {
            let ptr = vm.allocate(4, TypeCode::Closure)?;
            vm.heap.set_slot(ptr, 0, vm.scratch[base]);
            vm.heap.set_slot(ptr, 1, vm.scratch[base + 1]);
            Ok(Value::Ptr(ptr))
        })
    }

    pub(crate) fn new_class(&mut self, constructor: Value, statics: Value) -> Result<Value, Error> {
        self.rooted(&[constructor, statics], |vm, base| {
            let ptr = vm.allocate(4, TypeCode::Class)?;
            vm.heap.set_slot(ptr, 0, vm.scratch[base]);
            vm.heap.set_slot(ptr, 1, vm.scratch[base + 1]);
            Ok(Value::Ptr(ptr))
        })
    }

    /// Constructor and instance prototype of a class.
    pub(crate) fn class_parts(&self, class: Value) -> Result<(Value, Value), Error> {
        let obj = self
            .object_of_type(class, TypeCode::Class)
            .ok_or(Error::TypeError("value is not a class"))?;
        let constructor = self.resolve_handle(self.slot_of(obj, 0));
        let statics = self.slot_of(obj, 1);
        let prototype = match self.find_interned(b"prototype") {
            Some(key) if !statics.is_nullish() => self.get_property(statics, key)?,
            _ => Value::Undefined,
        };
        let prototype = if self.deep_type_of(prototype) == TypeCode::PropertyList {
            prototype
        } else {
            Value::Null
        };
        Ok((constructor, prototype))
    }
}
