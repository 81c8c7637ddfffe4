//! Copying garbage collector.
//!
//! Live allocations are copied breadth-first into a fresh bucket chain
//! (Cheney scan: to-space is walked allocation by allocation, forwarding
//! every slot, so no recursion is needed). Old locations are tracked in a
//! forwarding map instead of tombstones written into from-space.
//!
//! Two shapes are rewritten while copying: property lists are merged into
//! a single segment, and array backing stores are cut down to the array's
//! length. The runtime intern list is weak and is rebuilt afterwards from
//! the strings that survived.
use std::collections::{HashMap, HashSet};

use crate::error::Error;
use crate::heap::Heap;
use crate::value::{HeapPtr, TypeCode, Value};
use crate::vm::Vm;

pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

impl RootProvider for Vm<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        let intern_list = self.intern_list_global();
        for (index, global) in self.globals.iter_mut().enumerate() {
            if Some(index) != intern_list {
                visitor(global);
            }
        }
        self.handles.visit_mut(visitor);
        for value in &mut self.stack {
            visitor(value);
        }
        for value in &mut self.scratch {
            visitor(value);
        }
        for frame in &mut self.frames {
            visitor(&mut frame.saved.closure);
        }
        visitor(&mut self.regs.closure);
        visitor(&mut self.cps_callback);
        visitor(&mut self.job_queue);
    }
}

struct Collector<'h> {
    from: &'h Heap,
    to: Heap,
    /// Old body offset to new body offset.
    forwarded: HashMap<u16, u16>,
    error: Option<Error>,
}

impl<'h> Collector<'h> {
    fn new(from: &'h Heap, to: Heap) -> Self {
        Self {
            from,
            to,
            forwarded: HashMap::new(),
            error: None,
        }
    }

    fn fail(&mut self, msg: &'static str) {
        self.error.get_or_insert(Error::Corrupt(msg));
    }

    fn alloc(&mut self, size: usize, type_code: TypeCode) -> Option<HeapPtr> {
        let ptr = self.to.allocate(size, type_code);
        if ptr.is_none() {
            self.fail("to-space exhausted");
        }
        ptr
    }

    fn forward(&mut self, value: Value) -> Value {
        let Value::Ptr(ptr) = value else {
            return value;
        };
        if let Some(&new) = self.forwarded.get(&ptr.0) {
            return Value::Ptr(HeapPtr(new));
        }
        if !self.from.in_bounds(ptr) {
            self.fail("pointer outside the heap");
            return value;
        }
        let header = self.from.header(ptr);
        let copied = match header.type_code() {
            TypeCode::Tombstone => {
                self.fail("tombstone reached from a root");
                None
            }
            TypeCode::PropertyList => self.copy_property_list(ptr),
            code => self.alloc(header.size(), code).inspect(|&new| {
                self.to.body_mut(new).copy_from_slice(self.from.body(ptr));
            }),
        };
        match copied {
            Some(new) => {
                self.forwarded.insert(ptr.0, new.0);
                Value::Ptr(new)
            }
            None => value,
        }
    }

    /// Copy all segments of a property list into one allocation.
    fn copy_property_list(&mut self, head: HeapPtr) -> Option<HeapPtr> {
        let mut pairs = Vec::new();
        let mut segment = Some(head);
        let mut visited = 0;
        while let Some(current) = segment {
            let count = self.from.slot_count(current);
            for key_slot in (2..count.saturating_sub(1)).step_by(2) {
                pairs.push((
                    self.from.slot(current, key_slot),
                    self.from.slot(current, key_slot + 1),
                ));
            }
            segment = match self.from.slot(current, 0) {
                Value::Ptr(next) if self.from.in_bounds(next) => Some(next),
                _ => None,
            };
            visited += 1;
            if visited > self.from.used() {
                self.fail("cyclic property list");
                return None;
            }
        }
        let new = self.alloc(4 + 4 * pairs.len(), TypeCode::PropertyList)?;
        self.to.set_slot(new, 0, Value::Null);
        self.to.set_slot(new, 1, self.from.slot(head, 1));
        for (i, (key, value)) in pairs.into_iter().enumerate() {
            self.to.set_slot(new, 2 + 2 * i, key);
            self.to.set_slot(new, 3 + 2 * i, value);
        }
        Some(new)
    }

    fn scan(&mut self) {
        let mut cursor = 0;
        while let Some((ptr, header, next)) = self.to.allocation_at(cursor) {
            match header.type_code() {
                TypeCode::Array => self.scan_array(ptr),
                code if code.is_container() => {
                    for i in 0..header.size() / 2 {
                        let forwarded = self.forward(self.to.slot(ptr, i));
                        self.to.set_slot(ptr, i, forwarded);
                    }
                }
                _ => {}
            }
            cursor = next;
        }
    }

    /// Arrays get a private backing store sized to their length.
    fn scan_array(&mut self, array: HeapPtr) {
        let length = match self.to.slot(array, 1) {
            Value::Int(n) if n > 0 => n as usize,
            _ => 0,
        };
        let data = match self.to.slot(array, 0) {
            _ if length == 0 => Value::Null,
            Value::Ptr(old) if self.from.in_bounds(old) => {
                let keep = length.min(self.from.slot_count(old));
                match self.alloc(2 * keep, TypeCode::FixedLengthArray) {
                    Some(new) => {
                        for i in 0..keep {
                            self.to.set_slot(new, i, self.from.slot(old, i));
                        }
                        Value::Ptr(new)
                    }
                    None => Value::Null,
                }
            }
            other => other,
        };
        self.to.set_slot(array, 0, data);
    }

    /// New intern list holding the cells whose string survived, in the
    /// original order.
    fn rebuild_intern_list(&mut self, old_head: Value) -> Value {
        let mut survivors = Vec::new();
        let mut cell = old_head;
        while let Value::Ptr(ptr) = cell {
            if !self.from.in_bounds(ptr) {
                self.fail("intern list points outside the heap");
                break;
            }
            if let Value::Ptr(string) = self.from.slot(ptr, 1)
                && let Some(&new) = self.forwarded.get(&string.0)
            {
                survivors.push(new);
            }
            cell = self.from.slot(ptr, 0);
        }
        let mut head = Value::Null;
        for &string in survivors.iter().rev() {
            let Some(cell) = self.alloc(4, TypeCode::FixedLengthArray) else {
                break;
            };
            self.to.set_slot(cell, 0, head);
            self.to.set_slot(cell, 1, Value::Ptr(HeapPtr(string)));
            head = Value::Ptr(cell);
        }
        head
    }
}

impl Vm<'_> {
    /// Run a collection. With `squeeze` the heap ends up in a single bucket
    /// of exactly the live size.
    pub fn collect_garbage(&mut self, squeeze: bool) {
        let before = self.heap.used();
        let mut result = self.collect(None);
        if squeeze && result.is_ok() {
            let live = self.heap.used();
            result = self.collect(Some(live));
        }
        if let Err(err) = result {
            log::error!("garbage collection failed: {err}");
            self.dead = true;
            return;
        }
        self.gc_count += 1;
        log::debug!(
            "gc #{}: {} -> {} bytes in {} bucket(s)",
            self.gc_count,
            before,
            self.heap.used(),
            self.heap.bucket_count()
        );
    }

    fn collect(&mut self, exact_size: Option<usize>) -> Result<(), Error> {
        let settings = self.heap.settings().clone();
        let to = match exact_size {
            Some(size) => Heap::with_first_bucket(settings.clone(), size),
            None => Heap::new(settings.clone()),
        };
        let from = std::mem::replace(&mut self.heap, Heap::new(settings));
        let intern_list = self.intern_list_global();
        let old_head = intern_list.map_or(Value::Null, |index| self.globals[index]);

        let mut collector = Collector::new(&from, to);
        self.visit_roots(&mut |value| *value = collector.forward(*value));
        collector.scan();
        let new_head = collector.rebuild_intern_list(old_head);
        if let Some(index) = intern_list {
            self.globals[index] = new_head;
        }

        let Collector { to, error, .. } = collector;
        self.heap = to;
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Verify every heap header and every pointer held by the heap, the
    /// globals and the stack.
    pub fn check_heap(&self) -> Result<(), Error> {
        let used = self.heap.used();
        let mut bodies = HashSet::new();
        let mut cursor = 0;
        while cursor < used {
            let (ptr, header, next) = self
                .heap
                .allocation_at(cursor)
                .ok_or(Error::Corrupt("truncated allocation header"))?;
            if !header.type_code().is_valid_heap_type() {
                return Err(Error::Corrupt("invalid type code in heap"));
            }
            if next > used {
                return Err(Error::Corrupt("allocation overruns the heap"));
            }
            bodies.insert(ptr.0);
            cursor = next;
        }

        let check = |value: Value| match value {
            Value::Ptr(ptr) if !bodies.contains(&ptr.0) => {
                Err(Error::Corrupt("pointer does not name a heap allocation"))
            }
            Value::Rom(ptr) if ptr.0 as usize >= self.image.len() => {
                Err(Error::Corrupt("image pointer out of range"))
            }
            _ => Ok(()),
        };

        for (ptr, header) in self.heap.walk() {
            let code = header.type_code();
            if !code.is_container() {
                self.check_leaf(code, self.heap.body(ptr))?;
                continue;
            }
            let slots = header.size() / 2;
            for i in 0..slots {
                check(self.heap.slot(ptr, i))?;
            }
            match code {
                TypeCode::PropertyList if slots < 2 || slots % 2 != 0 => {
                    return Err(Error::Corrupt("malformed property list"));
                }
                TypeCode::Class if slots != 2 => return Err(Error::Corrupt("malformed class")),
                TypeCode::Array => self.check_array(ptr)?,
                _ => {}
            }
        }
        for &value in self.globals.iter().chain(&self.stack) {
            check(value)?;
        }
        check(self.regs.closure)?;
        check(self.job_queue)
    }

    /// Boxed numbers and host function references have fixed-size bodies.
    pub(crate) fn check_leaf(&self, code: TypeCode, body: &[u8]) -> Result<(), Error> {
        let expected = match code {
            TypeCode::Int32 => 4,
            TypeCode::Float64 => 8,
            TypeCode::HostFunc => 2,
            _ => return Ok(()),
        };
        if body.len() != expected {
            return Err(Error::Corrupt("boxed value has the wrong size"));
        }
        if code == TypeCode::HostFunc
            && u16::from_le_bytes([body[0], body[1]]) as usize >= self.imports.len()
        {
            return Err(Error::Corrupt("host function index out of range"));
        }
        Ok(())
    }

    fn check_array(&self, array: HeapPtr) -> Result<(), Error> {
        if self.heap.slot_count(array) != 2 {
            return Err(Error::Corrupt("malformed array"));
        }
        let Value::Int(length) = self.heap.slot(array, 1) else {
            return Err(Error::Corrupt("array length is not an integer"));
        };
        let capacity = match self.heap.slot(array, 0) {
            Value::Null => 0,
            Value::Ptr(data) if self.heap.header(data).type_code() == TypeCode::FixedLengthArray => {
                self.heap.slot_count(data)
            }
            _ => return Err(Error::Corrupt("array backing store is not a fixed array")),
        };
        if length < 0 || length as usize > capacity {
            return Err(Error::Corrupt("array length exceeds its capacity"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::builder::ImageBuilder;

    fn empty_vm(image: &[u8]) -> Vm<'_> {
        Vm::restore(image, |_| None).unwrap()
    }

    #[test]
    fn unreachable_objects_are_reclaimed() {
        let image = ImageBuilder::new().build();
        let mut vm = empty_vm(&image);
        let garbage = vm.new_object().unwrap();
        vm.set_property(garbage, Value::Int(0), Value::Int(1)).unwrap();
        let kept = vm.new_string("kept").unwrap();
        let handle = vm.new_handle(kept);
        vm.collect_garbage(false);
        let types: Vec<_> = vm.heap.walk().map(|(_, h)| h.type_code()).collect();
        assert_eq!(types, vec![TypeCode::String]);
        let kept = vm.handle_value(&handle).unwrap();
        assert_eq!(vm.string_bytes(kept), Some(&b"kept"[..]));
        vm.check_heap().unwrap();
    }

    #[test]
    fn property_segments_are_merged() {
        let image = ImageBuilder::new().build();
        let mut vm = empty_vm(&image);
        let obj = vm.new_object().unwrap();
        let handle = vm.new_handle(obj);
        for i in 0..3 {
            let obj = vm.handle_value(&handle).unwrap();
            vm.set_property(obj, Value::Int(i), Value::Int(i * 10)).unwrap();
        }
        vm.collect_garbage(false);
        let obj = vm.handle_value(&handle).unwrap();
        let ptr = obj.as_heap().unwrap();
        assert_eq!(vm.heap.slot_count(ptr), 2 + 2 * 3);
        assert_eq!(vm.heap.slot(ptr, 0), Value::Null);
        assert_eq!(vm.get_property(obj, Value::Int(2)).unwrap(), Value::Int(20));
    }

    #[test]
    fn empty_array_drops_its_backing_store() {
        let image = ImageBuilder::new().build();
        let mut vm = empty_vm(&image);
        let array = vm.new_array_with_capacity(8).unwrap();
        let handle = vm.new_handle(array);
        vm.collect_garbage(false);
        let array = vm.handle_value(&handle).unwrap().as_heap().unwrap();
        assert_eq!(vm.heap.slot(array, 0), Value::Null);
        assert_eq!(vm.heap.used(), 6);
    }

    #[test]
    fn squeeze_leaves_one_exact_bucket() {
        let image = ImageBuilder::new().build();
        let mut vm = empty_vm(&image);
        let array = vm.new_array().unwrap();
        let handle = vm.new_handle(array);
        for i in 0..50 {
            let array = vm.handle_value(&handle).unwrap();
            vm.array_push(array, Value::Int(i)).unwrap();
        }
        vm.collect_garbage(true);
        assert_eq!(vm.heap.bucket_count(), 1);
        assert_eq!(vm.heap.capacity(), vm.heap.used());
        vm.check_heap().unwrap();
    }

    #[test]
    fn cycles_are_copied_once() {
        let image = ImageBuilder::new().build();
        let mut vm = empty_vm(&image);
        let a = vm.new_object().unwrap();
        let handle = vm.new_handle(a);
        let b = vm.new_object().unwrap();
        let a = vm.handle_value(&handle).unwrap();
        vm.set_property(a, Value::Int(1), b).unwrap();
        let a = vm.handle_value(&handle).unwrap();
        let b = vm.get_property(a, Value::Int(1)).unwrap();
        vm.set_property(b, Value::Int(1), a).unwrap();
        vm.collect_garbage(false);
        assert_eq!(vm.heap.walk().count(), 2);
        let a = vm.handle_value(&handle).unwrap();
        let b = vm.get_property(a, Value::Int(1)).unwrap();
        assert_eq!(vm.get_property(b, Value::Int(1)).unwrap(), a);
    }
}
