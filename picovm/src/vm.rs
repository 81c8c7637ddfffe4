use std::any::Any;
use std::collections::HashSet;
use std::rc::Rc;

use crate::error::{Error, HostFunctionId};
use crate::handles::{Handle, HandleTable};
use crate::header::{Header, MAX_ALLOCATION_SIZE};
use crate::heap::{Heap, HeapSettings};
use crate::image::format::{Builtin, ImageHeader, Section, read_u16};
use crate::stack::{FrameBoundary, Registers};
use crate::value::{HeapPtr, RomPtr, TypeCode, Value};

/// A host function callable from bytecode. Receives the arguments without
/// `this`. Returning `Err(Error::Exception(v))` throws `v` into the script.
///
/// The argument slice is a copy taken at call time. Anything that can
/// allocate (the `new_*` constructors, `set_property`, `call`, a collection)
/// may move heap objects and leave pointer arguments stale: put arguments
/// that must outlive an allocation in a [`Handle`](crate::Handle) first and
/// read them back with [`Vm::handle_value`].
pub type HostFunction = Rc<dyn Fn(&mut Vm<'_>, HostFunctionId, &[Value]) -> Result<Value, Error>>;

/// Called before the instruction at a breakpoint address executes.
pub type BreakpointCallback = Box<dyn FnMut(&mut Vm<'_>, usize)>;

#[derive(Debug, Clone)]
pub struct VmCreateInfo {
    pub heap: HeapSettings,
    /// Value stack budget in slots, frame boundaries included.
    pub stack_size: usize,
}

impl Default for VmCreateInfo {
    fn default() -> Self {
        Self {
            heap: HeapSettings::default(),
            stack_size: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub heap_used: usize,
    pub heap_capacity: usize,
    pub heap_high_water_mark: usize,
    pub bucket_count: usize,
    pub globals_size: usize,
    pub import_table_size: usize,
    pub stack_height: usize,
    pub stack_size: usize,
    pub frame_count: usize,
    pub handle_count: usize,
    pub gc_count: usize,
}

/// Result of [`Vm::async_start`]: the host function returns `result` and
/// later completes the operation by calling `callback(isSuccess, value)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsyncCompletion {
    pub callback: Value,
    pub result: Value,
}

/// Host-facing classification of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Function,
    Object,
    Array,
    Uint8Array,
    Class,
}

/// Object location: live heap or read-only image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjRef {
    Heap(HeapPtr),
    Rom(usize),
}

pub struct Vm<'a> {
    pub(crate) image: &'a [u8],
    pub(crate) header: ImageHeader,
    pub(crate) imports: Vec<(HostFunctionId, HostFunction)>,
    pub(crate) globals: Vec<Value>,
    pub(crate) heap: Heap,
    /// The value stack shared by all frames.
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<FrameBoundary>,
    pub(crate) regs: Registers,
    /// Temporary roots held by native helpers across allocations.
    pub(crate) scratch: Vec<Value>,
    pub(crate) handles: HandleTable,
    pub(crate) job_queue: Value,
    /// Continuation offered to the next callee by `AwaitCall`.
    pub(crate) cps_callback: Value,
    pub(crate) stack_size: usize,
    /// Number of host functions currently executing.
    pub(crate) host_depth: usize,
    pub(crate) host_call_void: bool,
    pub(crate) breakpoints: HashSet<usize>,
    pub(crate) breakpoint_callback: Option<BreakpointCallback>,
    pub(crate) instruction_budget: Option<u64>,
    context: Option<Box<dyn Any>>,
    pub(crate) dead: bool,
    pub(crate) gc_count: usize,
}

impl<'a> Vm<'a> {
    /// Restore a VM from `image` with default settings.
    pub fn restore(
        image: &'a [u8],
        resolve_import: impl FnMut(HostFunctionId) -> Option<HostFunction>,
    ) -> Result<Self, Error> {
        Self::restore_with(image, VmCreateInfo::default(), resolve_import)
    }

    pub(crate) fn from_parts(
        image: &'a [u8],
        header: ImageHeader,
        imports: Vec<(HostFunctionId, HostFunction)>,
        globals: Vec<Value>,
        heap: Heap,
        info: &VmCreateInfo,
    ) -> Self {
        Self {
            image,
            header,
            imports,
            globals,
            heap,
            stack: Vec::with_capacity(info.stack_size.min(1024)),
            frames: Vec::new(),
            regs: Registers::default(),
            scratch: Vec::new(),
            handles: HandleTable::default(),
            job_queue: Value::Undefined,
            cps_callback: Value::Undefined,
            stack_size: info.stack_size,
            host_depth: 0,
            host_call_void: false,
            breakpoints: HashSet::new(),
            breakpoint_callback: None,
            instruction_budget: None,
            context: None,
            dead: false,
            gc_count: 0,
        }
    }

    pub fn image(&self) -> &'a [u8] {
        self.image
    }

    #[inline]
    pub(crate) fn ensure_alive(&self) -> Result<(), Error> {
        if self.dead { Err(Error::Dead) } else { Ok(()) }
    }

    /// Record a fatal error so later calls refuse to run.
    pub(crate) fn check_fatal<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result
            && err.is_fatal()
        {
            log::error!("fatal VM error: {err}");
            self.dead = true;
        }
        result
    }

    // ── image access ───────────────────────────────────────────────

    pub(crate) fn builtin(&self, builtin: Builtin) -> Value {
        let start = self.header.section_range(Section::Builtins).start;
        Value::decode(read_u16(self.image, start + 2 * builtin as usize))
    }

    pub(crate) fn rom_u16(&self, offset: usize) -> u16 {
        match self.image.get(offset..offset + 2) {
            Some(bytes) => u16::from_le_bytes([bytes[0], bytes[1]]),
            None => 0,
        }
    }

    pub(crate) fn rom_header(&self, offset: usize) -> Header {
        if offset < 2 {
            return Header(0);
        }
        Header(self.rom_u16(offset - 2))
    }

    /// Index of the global a handle refers to, if `ptr` is a handle.
    pub(crate) fn handle_global_index(&self, ptr: RomPtr) -> Option<usize> {
        let globals = self.header.section_range(Section::Globals);
        let offset = ptr.0 as usize;
        if globals.contains(&offset) {
            Some((offset - globals.start) / 2)
        } else {
            None
        }
    }

    /// Follow a handle to the current value of its global.
    pub(crate) fn resolve_handle(&self, value: Value) -> Value {
        if let Value::Rom(ptr) = value
            && let Some(index) = self.handle_global_index(ptr)
        {
            return self.globals.get(index).copied().unwrap_or(Value::Undefined);
        }
        value
    }

    pub(crate) fn obj_ref(&self, value: Value) -> Option<ObjRef> {
        match self.resolve_handle(value) {
            Value::Ptr(ptr) => Some(ObjRef::Heap(ptr)),
            Value::Rom(ptr) => Some(ObjRef::Rom(ptr.0 as usize)),
            _ => None,
        }
    }

    pub(crate) fn header_of(&self, obj: ObjRef) -> Header {
        match obj {
            ObjRef::Heap(ptr) => self.heap.header(ptr),
            ObjRef::Rom(offset) => self.rom_header(offset),
        }
    }

    pub(crate) fn body_of(&self, obj: ObjRef) -> &[u8] {
        match obj {
            ObjRef::Heap(ptr) => self.heap.body(ptr),
            ObjRef::Rom(offset) => {
                let size = self.rom_header(offset).size();
                let end = (offset + size).min(self.image.len());
                self.image.get(offset..end).unwrap_or(&[])
            }
        }
    }

    pub(crate) fn slot_count_of(&self, obj: ObjRef) -> usize {
        self.header_of(obj).size() / 2
    }

    pub(crate) fn slot_of(&self, obj: ObjRef, index: usize) -> Value {
        match obj {
            ObjRef::Heap(ptr) => self.heap.slot(ptr, index),
            ObjRef::Rom(offset) => Value::decode(self.rom_u16(offset + 2 * index)),
        }
    }

    pub(crate) fn set_slot_of(&mut self, obj: ObjRef, index: usize, value: Value) -> Result<(), Error> {
        match obj {
            ObjRef::Heap(ptr) => {
                self.heap.set_slot(ptr, index, value);
                Ok(())
            }
            ObjRef::Rom(_) => Err(Error::TypeError("cannot write to a read-only object")),
        }
    }

    /// Type code of `value`, looking through pointers and handles.
    pub fn deep_type_of(&self, value: Value) -> TypeCode {
        if let Some(code) = TypeCode::of_immediate(self.resolve_handle(value)) {
            return code;
        }
        match self.obj_ref(value) {
            Some(obj) => self.header_of(obj).type_code(),
            None => TypeCode::Undefined,
        }
    }

    // ── allocation ─────────────────────────────────────────────────

    /// Allocate a zeroed heap body. May collect garbage: heap values held
    /// in Rust locals are stale afterwards unless rooted. Running out of
    /// memory kills the VM, also outside a call.
    pub(crate) fn allocate(&mut self, size: usize, type_code: TypeCode) -> Result<HeapPtr, Error> {
        self.ensure_alive()?;
        if size > MAX_ALLOCATION_SIZE {
            return Err(Error::AllocationTooLarge(size));
        }
        if let Some(ptr) = self.heap.allocate(size, type_code) {
            return Ok(ptr);
        }
        log::debug!("heap limit reached allocating {size} bytes, collecting");
        self.collect_garbage(false);
        let ptr = self.heap.allocate(size, type_code).ok_or(Error::OutOfMemory);
        self.check_fatal(ptr)
    }

    /// Allocate a container and fill every slot with `fill`.
    pub(crate) fn allocate_slots(&mut self, count: usize, type_code: TypeCode, fill: Value) -> Result<HeapPtr, Error> {
        let ptr = self.allocate(count * 2, type_code)?;
        for i in 0..count {
            self.heap.set_slot(ptr, i, fill);
        }
        Ok(ptr)
    }

    /// Run `f` with `values` rooted in scratch slots `base..base + n`. Read
    /// them back with `vm.scratch[base + i]` after any allocation.
    pub(crate) fn rooted<R>(
        &mut self,
        values: &[Value],
        f: impl FnOnce(&mut Self, usize) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let base = self.scratch.len();
        self.scratch.extend_from_slice(values);
        let result = f(self, base);
        self.scratch.truncate(base);
        result
    }

    // ── handles ────────────────────────────────────────────────────

    pub fn new_handle(&mut self, value: Value) -> Handle {
        self.handles.insert(value)
    }

    pub fn handle_value(&self, handle: &Handle) -> Result<Value, Error> {
        self.handles.get(handle)
    }

    pub fn set_handle_value(&mut self, handle: &Handle, value: Value) -> Result<(), Error> {
        self.handles.set(handle, value)
    }

    pub fn release_handle(&mut self, handle: Handle) -> Result<Value, Error> {
        self.handles.remove(handle)
    }

    // ── host context ───────────────────────────────────────────────

    pub fn set_context(&mut self, context: Box<dyn Any>) {
        self.context = Some(context);
    }

    pub fn context<T: 'static>(&self) -> Option<&T> {
        self.context.as_ref()?.downcast_ref()
    }

    pub fn context_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.context.as_mut()?.downcast_mut()
    }

    // ── exports ────────────────────────────────────────────────────

    /// Value exported under `id`. Handles are followed, so a heap export
    /// yields its current location.
    pub fn resolve_export(&self, id: u16) -> Result<Value, Error> {
        let exports = self.header.section_range(Section::Export);
        for at in exports.step_by(4) {
            if read_u16(self.image, at) == id {
                let value = Value::decode(read_u16(self.image, at + 2));
                return Ok(self.resolve_handle(value));
            }
        }
        Err(Error::UnresolvedExport(id))
    }

    pub fn resolve_exports(&self, ids: &[u16]) -> Result<Vec<Value>, Error> {
        ids.iter().map(|&id| self.resolve_export(id)).collect()
    }

    /// Current value of global slot `index`.
    pub fn global(&self, index: usize) -> Option<Value> {
        self.globals.get(index).copied()
    }

    // ── debugging ──────────────────────────────────────────────────

    pub fn set_breakpoint(&mut self, address: usize) {
        self.breakpoints.insert(address);
    }

    pub fn remove_breakpoint(&mut self, address: usize) {
        self.breakpoints.remove(&address);
    }

    pub fn set_breakpoint_callback(&mut self, callback: Option<BreakpointCallback>) {
        self.breakpoint_callback = callback;
    }

    /// Abort the running call with [`Error::InstructionCountReached`] after
    /// `count` more instructions. `None` removes the limit.
    pub fn stop_after_n_instructions(&mut self, count: Option<u64>) {
        self.instruction_budget = count;
    }

    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            heap_used: self.heap.used(),
            heap_capacity: self.heap.capacity(),
            heap_high_water_mark: self.heap.high_water_mark(),
            bucket_count: self.heap.bucket_count(),
            globals_size: self.globals.len() * 2,
            import_table_size: self.imports.len() * std::mem::size_of::<(HostFunctionId, HostFunction)>(),
            stack_height: self.stack.len(),
            stack_size: self.stack_size,
            frame_count: self.frames.len(),
            handle_count: self.handles.len(),
            gc_count: self.gc_count,
        }
    }
}

#[cfg(test)]
mod tests;
