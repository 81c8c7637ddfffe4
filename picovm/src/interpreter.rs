//! The bytecode interpreter.
//!
//! One `run` loop per host entry: it decodes the instruction at `regs.pc`,
//! advances `pc` past it and dispatches through `execute`. Calls between
//! bytecode functions stay inside the loop (the caller's registers are
//! saved in a [`FrameBoundary`]); a call into a host function recurses
//! through Rust, and a host function calling back into the VM starts a new
//! `run` whose entry frame is marked `CALLED_FROM_HOST`.
//!
//! Stack layout of a frame:
//!
//! ```text
//! [callee] [this] [arg1 .. argN] | [locals / operands ...]
//!          ^ args_base           ^ frame_base
//! ```
use crate::bytecode::builder::small_literal_value;
use crate::bytecode::decoder::{BytecodeDecoder, align_resume_point};
use crate::bytecode::instruction::Instruction;
use crate::error::Error;
use crate::image::format::{Section, read_u16};
use crate::jobs::PromiseState;
use crate::objects::Callee;
use crate::stack::{
    ASYNC_CATCH_MARKER, CATCH_RECORD_SLOTS, CallFlags, FRAME_WORDS, FrameBoundary, Registers,
    catch_link, follow_catch_link,
};
use crate::value::{RomPtr, TypeCode, Value};
use crate::vm::{ObjRef, Vm};

/// What the run loop does after an instruction.
enum Flow {
    Continue,
    /// The host entry frame returned this value.
    Return(Value),
}

/// Fixed slots at the start of an async activation closure.
const ASYNC_CONTINUATION: usize = 0;
const ASYNC_CALLBACK: usize = 1;
const ASYNC_SAVED_COUNT: usize = 2;
const ASYNC_SAVED_CATCH: usize = 3;
const ASYNC_FIXED_SLOTS: usize = 4;

/// Largest byte array `Uint8ArrayNew` creates.
const MAX_UINT8_ARRAY_LENGTH: i32 = 0x0FFF;

impl<'a> Vm<'a> {
    /// Call `function` with `this = undefined` and `args`.
    ///
    /// Uncaught script exceptions come back as [`Error::Exception`]. When
    /// this is the outermost call, queued jobs run before it returns.
    pub fn call(&mut self, function: Value, args: &[Value]) -> Result<Value, Error> {
        self.ensure_alive()?;
        let result = self.call_from_host(function, args, CallFlags::CALLED_FROM_HOST);
        let result = self.check_fatal(result)?;
        if !self.frames.is_empty() || self.host_depth > 0 || !self.has_pending_jobs() {
            return Ok(result);
        }
        let drained = self.rooted(&[result], |vm, base| {
            vm.drain_jobs()?;
            Ok(vm.scratch[base])
        });
        self.check_fatal(drained)
    }

    /// Enter `function` from native code and run it to completion. On error
    /// the stack, the frames and the registers are put back as they were.
    ///
    /// A callback offered to the host function that is re-entering belongs
    /// to that host function, not to `function`: it is set aside for the
    /// nested run and restored afterwards.
    pub(crate) fn call_from_host(
        &mut self,
        function: Value,
        args: &[Value],
        flags: CallFlags,
    ) -> Result<Value, Error> {
        let offered = std::mem::replace(&mut self.cps_callback, Value::Undefined);
        self.rooted(&[offered], |vm, base| {
            let result = vm.enter_from_host(function, args, flags);
            vm.cps_callback = vm.scratch[base];
            result
        })
    }

    fn enter_from_host(
        &mut self,
        function: Value,
        args: &[Value],
        flags: CallFlags,
    ) -> Result<Value, Error> {
        let entry_frames = self.frames.len();
        let base = self.stack.len();
        let callee = self.resolve_callee(function)?;
        self.stack.push(function);
        self.stack.push(Value::Undefined);
        self.stack.extend_from_slice(args);

        let result = match self.begin_call(callee, args.len() + 1, flags) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => self.run(),
            Err(err) => Err(err),
        };
        if result.is_err() {
            if let Some(frame) = self.frames.get(entry_frames) {
                self.regs = frame.saved;
            }
            self.frames.truncate(entry_frames);
            self.stack.truncate(base);
        }
        result
    }

    fn run(&mut self) -> Result<Value, Error> {
        let code_end = self.header.section_range(Section::Rom).end;
        loop {
            let pc = self.regs.pc;
            if self.breakpoints.contains(&pc) {
                self.hit_breakpoint(pc);
            }
            if let Some(budget) = self.instruction_budget.as_mut() {
                if *budget == 0 {
                    self.instruction_budget = None;
                    log::debug!("instruction budget exhausted at {pc:#06x}");
                    return Err(Error::InstructionCountReached);
                }
                *budget -= 1;
            }

            let mut decoder = BytecodeDecoder::with_range(self.image, pc, code_end);
            let instruction = decoder.decode_next()?;
            self.regs.pc = decoder.offset();
            if !matches!(instruction, Instruction::AsyncStart { .. }) {
                self.cps_callback = Value::Undefined;
            }
            log::trace!("{pc:#06x}: {instruction}");

            let flow = match self.execute(instruction) {
                Ok(flow) => flow,
                Err(err) => self.raise(err)?,
            };
            if let Flow::Return(value) = flow {
                return Ok(value);
            }
        }
    }

    fn hit_breakpoint(&mut self, pc: usize) {
        if let Some(mut callback) = self.breakpoint_callback.take() {
            callback(self, pc);
            if self.breakpoint_callback.is_none() {
                self.breakpoint_callback = Some(callback);
            }
        }
    }

    // ── operand stack ──────────────────────────────────────────────

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, Error> {
        if self.stack.len() <= self.regs.frame_base {
            return Err(Error::Corrupt("operand stack underflow"));
        }
        self.stack.pop().ok_or(Error::Corrupt("operand stack underflow"))
    }

    /// Value `depth` slots below the top.
    fn peek(&self, depth: usize) -> Result<Value, Error> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .filter(|&at| at >= self.regs.frame_base)
            .map(|at| self.stack[at])
            .ok_or(Error::Corrupt("operand stack underflow"))
    }

    fn drop_n(&mut self, count: usize) -> Result<(), Error> {
        let len = self
            .stack
            .len()
            .checked_sub(count)
            .filter(|&len| len >= self.regs.frame_base)
            .ok_or(Error::Corrupt("operand stack underflow"))?;
        self.stack.truncate(len);
        Ok(())
    }

    /// Pop `count` operands and push `value` in their place.
    fn replace_top(&mut self, count: usize, value: Value) -> Result<(), Error> {
        self.drop_n(count)?;
        self.push(value);
        Ok(())
    }

    fn local_slot(&self, index: u16) -> Result<usize, Error> {
        let at = self.regs.frame_base + index as usize;
        if at >= self.stack.len() {
            return Err(Error::Corrupt("local variable out of range"));
        }
        Ok(at)
    }

    /// Scope object and slot for scoped variable `index`. Every scope's
    /// last slot links to its parent scope.
    fn scoped_slot(&self, index: u16) -> Result<(ObjRef, usize), Error> {
        let mut index = index as usize;
        let mut scope = self.regs.closure;
        loop {
            let obj = self
                .object_of_type(scope, TypeCode::Closure)
                .ok_or(Error::Corrupt("scoped variable out of range"))?;
            let own = self.slot_count_of(obj).saturating_sub(1);
            if index < own {
                return Ok((obj, index));
            }
            index -= own;
            scope = self.slot_of(obj, own);
        }
    }

    // ── dispatch ───────────────────────────────────────────────────

    fn execute(&mut self, instruction: Instruction) -> Result<Flow, Error> {
        use Instruction as I;
        match instruction {
            I::LoadSmallLiteral(lit) => self.push(small_literal_value(lit)),
            I::LoadVar { index } => {
                let value = self.stack[self.local_slot(index)?];
                self.push(value);
            }
            I::LoadScoped { index } => {
                let (scope, slot) = self.scoped_slot(index)?;
                let value = self.resolve_handle(self.slot_of(scope, slot));
                self.push(value);
            }
            I::LoadArg { index } => {
                let index = index as usize;
                let value = if index < self.regs.arg_count {
                    self.stack[self.regs.args_base + index]
                } else {
                    Value::Undefined
                };
                self.push(value);
            }
            I::LoadGlobal { index } => {
                let value = *self
                    .globals
                    .get(index as usize)
                    .ok_or(Error::Corrupt("global index out of range"))?;
                self.push(value);
            }
            I::LoadLiteral { raw } => {
                let value = self.resolve_handle(Value::decode(raw));
                self.push(value);
            }
            I::StoreVar { index } => {
                let value = self.pop()?;
                let at = self.local_slot(index)?;
                self.stack[at] = value;
            }
            I::StoreScoped { index } => {
                let value = self.pop()?;
                let (scope, slot) = self.scoped_slot(index)?;
                self.set_slot_of(scope, slot, value)?;
            }
            I::StoreArg { index } => {
                let value = self.pop()?;
                if (index as usize) < self.regs.arg_count {
                    self.stack[self.regs.args_base + index as usize] = value;
                }
            }
            I::StoreGlobal { index } => {
                let value = self.pop()?;
                *self
                    .globals
                    .get_mut(index as usize)
                    .ok_or(Error::Corrupt("global index out of range"))? = value;
            }

            I::Call { argc, void } => {
                let callee = self.resolve_callee(self.peek(argc as usize)?)?;
                let flags = if void { CallFlags::VOID_CALL } else { CallFlags::empty() };
                if let Some(result) = self.begin_call(callee, argc as usize, flags)?
                    && !void
                {
                    self.push(result);
                }
            }
            I::CallShort { index } => {
                let (callee, argc) = self.short_call_entry(index)?;
                self.call_with_placeholder(callee, argc)?;
            }
            I::CallHost { import, argc } => {
                if import as usize >= self.imports.len() {
                    return Err(Error::Corrupt("host import index out of range"));
                }
                self.call_with_placeholder(Callee::Host(import as usize), argc as usize)?;
            }
            I::New { argc } => self.construct(argc as usize)?,
            I::Return => {
                let value = self.pop()?;
                return self.do_return(value);
            }
            I::Throw => return Err(Error::Exception(self.pop()?)),

            I::Jump { offset } => self.jump(offset)?,
            I::Branch { offset } => {
                let condition = self.pop()?;
                if self.to_bool(condition) {
                    self.jump(offset)?;
                }
            }
            I::StartTry { catch_offset } => {
                let at = self.stack.len();
                self.push(catch_link(at, self.regs.catch_target));
                self.push(Value::Int(catch_offset as i16));
                self.regs.catch_target = Some(at);
            }
            I::EndTry => {
                let at = self
                    .regs
                    .catch_target
                    .filter(|&at| at >= self.regs.frame_base)
                    .ok_or(Error::Corrupt("end of try without a catch record"))?;
                let link = self.stack[at];
                self.stack.truncate(at);
                self.regs.catch_target = follow_catch_link(at, link);
            }

            I::Pop => self.drop_n(1)?,
            I::PopN { count } => self.drop_n(count as usize)?,

            I::ScopeNew { slots } => {
                if slots == 0 {
                    return Err(Error::Corrupt("scope without a parent slot"));
                }
                let slots = slots as usize;
                let ptr = self.allocate_slots(slots, TypeCode::Closure, Value::Undefined)?;
                self.heap.set_slot(ptr, slots - 1, self.regs.closure);
                self.regs.closure = Value::Ptr(ptr);
            }
            I::ScopePop => {
                let scope = self
                    .object_of_type(self.regs.closure, TypeCode::Closure)
                    .ok_or(Error::Corrupt("no scope to pop"))?;
                let parent = self.slot_count_of(scope).saturating_sub(1);
                self.regs.closure = self.slot_of(scope, parent);
            }
            I::ScopeClone => {
                let scope = self
                    .object_of_type(self.regs.closure, TypeCode::Closure)
                    .ok_or(Error::Corrupt("no scope to clone"))?;
                let count = self.slot_count_of(scope);
                let ptr = self.allocate_slots(count, TypeCode::Closure, Value::Undefined)?;
                let scope = self
                    .obj_ref(self.regs.closure)
                    .ok_or(Error::Corrupt("scope lost during clone"))?;
                for i in 0..count {
                    let value = self.slot_of(scope, i);
                    self.heap.set_slot(ptr, i, value);
                }
                self.regs.closure = Value::Ptr(ptr);
            }
            I::ClosureNew => {
                let closure = self.new_closure(self.peek(0)?, self.regs.closure)?;
                self.replace_top(1, closure)?;
            }

            I::ObjectNew => {
                let object = self.new_object()?;
                self.push(object);
            }
            I::ObjectGet => {
                let value = self.get_property(self.peek(1)?, self.peek(0)?)?;
                self.replace_top(2, value)?;
            }
            I::ObjectSet => {
                self.set_property(self.peek(2)?, self.peek(1)?, self.peek(0)?)?;
                self.drop_n(3)?;
            }
            I::ObjectGetKey { raw_key } => {
                let key = self.resolve_handle(Value::decode(raw_key));
                let value = self.get_property(self.peek(0)?, key)?;
                self.replace_top(1, value)?;
            }
            I::ObjectSetKey { raw_key } => {
                let key = self.resolve_handle(Value::decode(raw_key));
                self.set_property(self.peek(1)?, key, self.peek(0)?)?;
                self.drop_n(2)?;
            }
            I::ObjectKeys => {
                let keys = self.own_keys(self.peek(0)?)?;
                self.replace_top(1, keys)?;
            }
            I::ArrayNew { capacity } => {
                let array = self.new_array_with_capacity(capacity as usize)?;
                self.push(array);
            }
            I::ArrayGet { index } => {
                let value = self.get_property(self.peek(0)?, Value::Int(index as i16))?;
                self.replace_top(1, value)?;
            }
            I::ArraySet { index } => {
                self.set_property(self.peek(1)?, Value::Int(index as i16), self.peek(0)?)?;
                self.drop_n(2)?;
            }
            I::FixedArrayNew { length } => {
                let array = self.new_fixed_array(length as usize, Value::Undefined)?;
                self.push(array);
            }
            I::Uint8ArrayNew => {
                let length = match self.peek(0)? {
                    Value::Int(n) if (0..=MAX_UINT8_ARRAY_LENGTH).contains(&(n as i32)) => n as usize,
                    _ => return Err(Error::RangeError("invalid Uint8Array length")),
                };
                let bytes = self.new_uint8_array(&vec![0; length])?;
                self.replace_top(1, bytes)?;
            }
            I::ClassCreate => {
                let class = self.new_class(self.peek(1)?, self.peek(0)?)?;
                self.replace_top(2, class)?;
            }

            I::NumOp(op) if op.is_unary() => {
                let result = self.num_op(op, self.peek(0)?, Value::Undefined)?;
                self.replace_top(1, result)?;
            }
            I::NumOp(op) => {
                let result = self.num_op(op, self.peek(1)?, self.peek(0)?)?;
                self.replace_top(2, result)?;
            }
            I::BitOp(op) if op.is_unary() => {
                let result = self.bit_op(op, self.peek(0)?, Value::Undefined)?;
                self.replace_top(1, result)?;
            }
            I::BitOp(op) => {
                let result = self.bit_op(op, self.peek(1)?, self.peek(0)?)?;
                self.replace_top(2, result)?;
            }
            I::Add => {
                let result = self.add(self.peek(1)?, self.peek(0)?)?;
                self.replace_top(2, result)?;
            }
            I::Equal | I::NotEqual => {
                let equal = self.equal(self.peek(1)?, self.peek(0)?);
                let result = Value::from_bool(equal == matches!(instruction, I::Equal));
                self.replace_top(2, result)?;
            }
            I::LogicalNot => {
                let result = Value::from_bool(!self.to_bool(self.peek(0)?));
                self.replace_top(1, result)?;
            }
            I::TypeOf => {
                let name = self.typeof_value(self.peek(0)?)?;
                self.replace_top(1, name)?;
            }
            I::TypeCodeOf => {
                let code = self.deep_type_of(self.peek(0)?) as u8;
                self.replace_top(1, Value::Int(code as i16))?;
            }

            I::AsyncStart { slots } => self.async_start_frame(slots as usize)?,
            I::Await => return self.await_value(),
            I::AwaitCall { argc } => {
                self.cps_callback = self.regs.closure;
                let callee = self.resolve_callee(self.peek(argc as usize)?)?;
                if let Some(result) = self.begin_call(callee, argc as usize, CallFlags::empty())? {
                    self.push(result);
                }
            }
            I::AsyncResume => return self.async_resume(),
            I::AsyncReturn => {
                let result = self.pop()?;
                return self.async_return(result);
            }
            I::AsyncComplete => {
                let is_success = self.to_bool(self.peek(1)?);
                self.complete(self.peek(2)?, is_success, self.peek(0)?)?;
                self.drop_n(3)?;
            }
            I::Nop => {}
        }
        Ok(Flow::Continue)
    }

    fn jump(&mut self, offset: i16) -> Result<(), Error> {
        self.regs.pc = self
            .regs
            .pc
            .checked_add_signed(offset as isize)
            .ok_or(Error::Corrupt("jump before the image start"))?;
        Ok(())
    }

    // ── calls ──────────────────────────────────────────────────────

    /// Target and argument count of a short-call table entry.
    fn short_call_entry(&self, index: u8) -> Result<(Callee, usize), Error> {
        let table = self.header.section_range(Section::ShortCallTable);
        let at = table.start + 4 * index as usize;
        if at + 4 > table.end {
            return Err(Error::Corrupt("short-call index out of range"));
        }
        let target = read_u16(self.image, at);
        let argc = self.image[at + 2] as usize;
        let callee = if target & 1 == 1 {
            let import = (target >> 1) as usize;
            if import >= self.imports.len() {
                return Err(Error::Corrupt("host import index out of range"));
            }
            Callee::Host(import)
        } else {
            self.resolve_callee(Value::Rom(RomPtr(target)))?
        };
        Ok((callee, argc))
    }

    /// Calls whose target is encoded in the instruction have no callee on
    /// the stack; give them an empty slot so every frame looks the same.
    fn call_with_placeholder(&mut self, callee: Callee, argc: usize) -> Result<(), Error> {
        let at = self
            .stack
            .len()
            .checked_sub(argc)
            .filter(|&at| at >= self.regs.frame_base)
            .ok_or(Error::Corrupt("operand stack underflow"))?;
        self.stack.insert(at, Value::Undefined);
        if let Some(result) = self.begin_call(callee, argc, CallFlags::empty())? {
            self.push(result);
        }
        Ok(())
    }

    /// Start a call with `[callee, this, args...]` on top of the stack.
    /// Host and no-op calls complete immediately and return their result
    /// with the call slots already popped; a bytecode call pushes a frame
    /// and returns `None`.
    fn begin_call(
        &mut self,
        callee: Callee,
        argc: usize,
        flags: CallFlags,
    ) -> Result<Option<Value>, Error> {
        let callee_slot = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or(Error::Corrupt("call without a callee slot"))?;
        match callee {
            Callee::NoOp => {
                self.stack.truncate(callee_slot);
                Ok(Some(Value::Undefined))
            }
            Callee::Host(index) => self.call_host(index, callee_slot, flags).map(Some),
            Callee::Bytecode {
                function,
                pc,
                closure,
            } => {
                let needed = self.stack.len()
                    + (self.frames.len() + 1) * FRAME_WORDS
                    + self.max_stack_depth(function);
                if needed > self.stack_size {
                    log::debug!("stack overflow: {needed} > {} slots", self.stack_size);
                    return Err(Error::StackOverflow);
                }
                self.frames.push(FrameBoundary { saved: self.regs });
                let frame_base = self.stack.len();
                self.regs = Registers {
                    pc,
                    function,
                    frame_base,
                    args_base: frame_base - argc,
                    arg_count: argc,
                    flags,
                    closure,
                    catch_target: if flags.contains(CallFlags::CALLED_FROM_HOST) {
                        None
                    } else {
                        self.regs.catch_target
                    },
                };
                Ok(None)
            }
        }
    }

    fn call_host(&mut self, index: usize, callee_slot: usize, flags: CallFlags) -> Result<Value, Error> {
        let (id, function) = self
            .imports
            .get(index)
            .map(|(id, function)| (*id, function.clone()))
            .ok_or(Error::Corrupt("host import index out of range"))?;
        let args = self.stack.get(callee_slot + 2..).unwrap_or(&[]).to_vec();
        log::trace!("host call {id} with {} argument(s)", args.len());

        self.host_depth += 1;
        let outer_void = std::mem::replace(&mut self.host_call_void, flags.contains(CallFlags::VOID_CALL));
        let result = function(self, id, &args);
        self.host_call_void = outer_void;
        self.host_depth -= 1;
        self.cps_callback = Value::Undefined;
        self.stack.truncate(callee_slot);
        result
    }

    fn do_return(&mut self, value: Value) -> Result<Flow, Error> {
        let flags = self.regs.flags;
        let callee_slot = self
            .regs
            .args_base
            .checked_sub(1)
            .ok_or(Error::Corrupt("frame without a callee slot"))?;
        let frame = self
            .frames
            .pop()
            .ok_or(Error::Corrupt("return without a frame"))?;
        self.stack.truncate(callee_slot);
        self.regs = frame.saved;
        if flags.contains(CallFlags::CALLED_FROM_HOST) {
            return Ok(Flow::Return(value));
        }
        if !flags.contains(CallFlags::VOID_CALL) {
            self.push(value);
        }
        Ok(Flow::Continue)
    }

    /// `new Class(args...)`: `[class, args...] -> [object]`.
    fn construct(&mut self, argc: usize) -> Result<(), Error> {
        let (_, prototype) = self.class_parts(self.peek(argc)?)?;
        let object = self.new_object_with_proto(prototype)?;
        let class_slot = self.stack.len() - argc - 1;
        let (constructor, _) = self.class_parts(self.stack[class_slot])?;
        let callee = if constructor.is_nullish() {
            Callee::NoOp
        } else {
            self.resolve_callee(constructor)?
        };
        // [object, constructor, this = object, args...]
        self.stack[class_slot] = object;
        self.stack.insert(class_slot + 1, constructor);
        self.stack.insert(class_slot + 2, object);
        self.begin_call(callee, argc + 1, CallFlags::VOID_CALL)?;
        Ok(())
    }

    // ── exceptions ─────────────────────────────────────────────────

    /// Route an instruction error: catchable errors are thrown into the
    /// script when a handler exists, everything else unwinds to the host.
    fn raise(&mut self, err: Error) -> Result<Flow, Error> {
        if !err.is_catchable() || self.regs.catch_target.is_none() {
            return Err(err);
        }
        let exception = match err {
            Error::Exception(value) => value,
            other => {
                log::debug!("throwing {other} into the script");
                self.new_string(&other.to_string())?
            }
        };
        self.throw(exception)
    }

    fn throw(&mut self, exception: Value) -> Result<Flow, Error> {
        let target = self.regs.catch_target.ok_or(Error::Exception(exception))?;
        while target < self.regs.frame_base {
            let frame = self
                .frames
                .pop()
                .ok_or(Error::Corrupt("catch target outside the call stack"))?;
            self.regs = frame.saved;
        }
        if target + CATCH_RECORD_SLOTS > self.stack.len() {
            return Err(Error::Corrupt("catch record beyond the stack top"));
        }
        let link = self.stack[target];
        let handler = self.stack[target + 1];
        self.stack.truncate(target);
        self.regs.catch_target = follow_catch_link(target, link);
        match handler {
            Value::Int(ASYNC_CATCH_MARKER) => {
                let callback = self.async_slot(ASYNC_CALLBACK)?;
                self.complete(callback, false, exception)?;
                let result = self.async_sync_result()?;
                self.do_return(result)
            }
            Value::Int(offset) if offset >= 0 => {
                self.regs.pc = self.regs.function + offset as usize;
                self.push(exception);
                Ok(Flow::Continue)
            }
            _ => Err(Error::Corrupt("malformed catch record")),
        }
    }

    // ── async functions ────────────────────────────────────────────

    fn async_closure(&self) -> Result<ObjRef, Error> {
        self.object_of_type(self.regs.closure, TypeCode::Closure)
            .filter(|obj| self.slot_count_of(*obj) > ASYNC_FIXED_SLOTS)
            .ok_or(Error::Corrupt("async operation outside an async activation"))
    }

    fn async_slot(&self, slot: usize) -> Result<Value, Error> {
        Ok(self.slot_of(self.async_closure()?, slot))
    }

    /// What an async function hands back to its synchronous caller.
    fn async_sync_result(&self) -> Result<Value, Error> {
        let callback = self.async_slot(ASYNC_CALLBACK)?;
        Ok(match callback {
            Value::NoOpFunction => Value::Undefined,
            _ if self.promise_state(callback).is_some() => callback,
            _ => Value::Deleted,
        })
    }

    fn push_async_catch_record(&mut self) {
        let at = self.stack.len();
        self.push(catch_link(at, self.regs.catch_target));
        self.push(Value::Int(ASYNC_CATCH_MARKER));
        self.regs.catch_target = Some(at);
    }

    fn async_start_frame(&mut self, slots: usize) -> Result<(), Error> {
        if slots <= ASYNC_FIXED_SLOTS {
            return Err(Error::Corrupt("async activation too small"));
        }
        let offered = std::mem::replace(&mut self.cps_callback, Value::Undefined);
        let callback = if offered != Value::Undefined {
            offered
        } else if self.regs.flags.contains(CallFlags::VOID_CALL) {
            Value::NoOpFunction
        } else {
            self.new_promise()?
        };
        let closure = self.rooted(&[callback], |vm, base| {
            let ptr = vm.allocate_slots(slots, TypeCode::Closure, Value::Undefined)?;
            vm.heap.set_slot(ptr, ASYNC_CALLBACK, vm.scratch[base]);
            vm.heap.set_slot(ptr, ASYNC_SAVED_COUNT, Value::Int(0));
            vm.heap.set_slot(ptr, slots - 1, vm.regs.closure);
            Ok(Value::Ptr(ptr))
        })?;
        self.regs.closure = closure;
        self.push_async_catch_record();
        Ok(())
    }

    /// Suspend the activation until the awaited value settles.
    fn await_value(&mut self) -> Result<Flow, Error> {
        let awaited = self.pop()?;
        let Value::Ptr(closure) = self.regs.closure else {
            return Err(Error::Corrupt("await outside an async activation"));
        };
        self.async_closure()?;
        let frame_base = self.regs.frame_base;
        let live = self
            .stack
            .get(frame_base + CATCH_RECORD_SLOTS..)
            .ok_or(Error::Corrupt("await without the async catch record"))?
            .to_vec();
        let slots = self.heap.slot_count(closure);
        if ASYNC_FIXED_SLOTS + live.len() + 1 > slots {
            return Err(Error::Corrupt("async activation cannot hold the awaited stack"));
        }
        let save_start = slots - 1 - live.len();
        for (i, &value) in live.iter().enumerate() {
            self.heap.set_slot(closure, save_start + i, value);
        }
        let catch = self
            .regs
            .catch_target
            .and_then(|at| at.checked_sub(frame_base))
            .ok_or(Error::Corrupt("await outside the async catch record"))?;
        self.heap.set_slot(closure, ASYNC_SAVED_COUNT, Value::Int(live.len() as i16));
        self.heap.set_slot(closure, ASYNC_SAVED_CATCH, Value::Int(catch as i16));
        let resume = align_resume_point(self.regs.pc);
        self.heap.set_slot(closure, ASYNC_CONTINUATION, Value::Rom(RomPtr(resume as u16)));

        let subscriber = self.regs.closure;
        match awaited {
            Value::Deleted => {}
            _ => match self.promise_state(awaited) {
                Some((PromiseState::Pending, _)) => self.subscribe(awaited, subscriber)?,
                Some((state, out)) => {
                    let ok = state == PromiseState::Resolved;
                    self.schedule(subscriber, ok, out)?;
                }
                None => self.schedule(subscriber, true, awaited)?,
            },
        }

        let link = self.stack[frame_base];
        self.stack.truncate(frame_base);
        self.regs.catch_target = follow_catch_link(frame_base, link);
        let result = self.async_sync_result()?;
        self.do_return(result)
    }

    /// First instruction of a continuation: rebuild the suspended frame and
    /// deliver the awaited outcome.
    fn async_resume(&mut self) -> Result<Flow, Error> {
        let Value::Ptr(closure) = self.regs.closure else {
            return Err(Error::Corrupt("resume outside an async activation"));
        };
        self.async_closure()?;
        let frame_base = self.regs.frame_base;
        self.push_async_catch_record();

        let slots = self.heap.slot_count(closure);
        let saved = match self.heap.slot(closure, ASYNC_SAVED_COUNT) {
            Value::Int(n) if n >= 0 && (n as usize) + ASYNC_FIXED_SLOTS < slots => n as usize,
            _ => return Err(Error::Corrupt("bad saved stack count")),
        };
        let save_start = slots - 1 - saved;
        for i in save_start..slots - 1 {
            let value = self.heap.slot(closure, i);
            self.push(value);
            self.heap.set_slot(closure, i, Value::Undefined);
        }
        self.heap.set_slot(closure, ASYNC_SAVED_COUNT, Value::Int(0));
        self.regs.catch_target = match self.heap.slot(closure, ASYNC_SAVED_CATCH) {
            Value::Int(rel) if rel >= 0 => Some(frame_base + rel as usize),
            _ => return Err(Error::Corrupt("bad saved catch target")),
        };

        let arg = |vm: &Self, index: usize| {
            if index < vm.regs.arg_count {
                vm.stack[vm.regs.args_base + index]
            } else {
                Value::Undefined
            }
        };
        let is_success = self.to_bool(arg(self, 1));
        let result = arg(self, 2);
        if is_success {
            self.push(result);
            Ok(Flow::Continue)
        } else {
            Err(Error::Exception(result))
        }
    }

    fn async_return(&mut self, result: Value) -> Result<Flow, Error> {
        let frame_base = self.regs.frame_base;
        if self.stack.len() < frame_base + CATCH_RECORD_SLOTS {
            return Err(Error::Corrupt("async return without its catch record"));
        }
        let link = self.stack[frame_base];
        self.stack.truncate(frame_base);
        self.regs.catch_target = follow_catch_link(frame_base, link);
        // Keep the result reachable while completion allocates.
        self.push(result);
        let callback = self.async_slot(ASYNC_CALLBACK)?;
        self.complete(callback, true, result)?;
        self.stack.truncate(frame_base);
        let result = self.async_sync_result()?;
        self.do_return(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::FunctionBuilder;
    use crate::bytecode::op::NumOp;
    use crate::image::builder::ImageBuilder;

    fn export_function(f: FunctionBuilder) -> Vec<u8> {
        let mut b = ImageBuilder::new();
        let function = b.function(f);
        b.export(1, function);
        b.build()
    }

    #[test]
    fn locals_and_branches() {
        // let n = arg1, acc = 0; while (n > 0) { acc = acc + n; n = n - 1 } return acc
        let mut f = FunctionBuilder::new();
        let top = f.new_label();
        let done = f.new_label();
        f.load_arg(1);
        f.load_int(0);
        f.bind(top);
        f.load_var(0);
        f.load_int(0);
        f.num_op(NumOp::LessEqual);
        f.branch(done);
        f.load_var(1);
        f.load_var(0);
        f.add();
        f.store_var(1);
        f.load_var(0);
        f.load_int(1);
        f.num_op(NumOp::Subtract);
        f.store_var(0);
        f.jump(top);
        f.bind(done);
        f.load_var(1);
        f.return_();
        let image = export_function(f);
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let function = vm.resolve_export(1).unwrap();
        assert_eq!(vm.call(function, &[Value::Int(10)]).unwrap(), Value::Int(55));
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn uncaught_type_error_reaches_the_host() {
        let mut f = FunctionBuilder::new();
        f.load_literal(Value::Undefined);
        f.object_get_key(Value::StrLength);
        f.return_();
        let image = export_function(f);
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let function = vm.resolve_export(1).unwrap();
        assert!(matches!(vm.call(function, &[]), Err(Error::TypeError(_))));
        assert!(vm.stack.is_empty());
        // Still usable afterwards.
        assert!(matches!(vm.call(function, &[]), Err(Error::TypeError(_))));
    }

    #[test]
    fn caught_type_error_becomes_a_string() {
        let mut f = FunctionBuilder::new();
        let handler = f.new_label();
        f.start_try(handler);
        f.load_literal(Value::Null);
        f.object_get_key(Value::StrLength);
        f.return_();
        f.bind(handler);
        f.enter_handler();
        f.return_();
        let image = export_function(f);
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let function = vm.resolve_export(1).unwrap();
        let caught = vm.call(function, &[]).unwrap();
        assert!(vm.value_to_string(caught).starts_with("TypeError"));
    }

    #[test]
    fn scopes_and_closures() {
        // Outer creates a scope holding arg1 and returns a closure reading it.
        let mut b = ImageBuilder::new();
        let mut inner = FunctionBuilder::new();
        inner.load_scoped(1);
        inner.return_();
        let inner = b.function(inner);
        let mut outer = FunctionBuilder::new();
        outer.scope_new(2);
        outer.load_arg(1);
        outer.store_scoped(0);
        outer.load_literal(inner);
        outer.closure_new();
        outer.return_();
        let outer = b.function(outer);
        b.export(1, outer);
        let image = b.build();

        let mut vm = Vm::restore(&image, |_| None).unwrap();
        let outer = vm.resolve_export(1).unwrap();
        let closure = vm.call(outer, &[Value::Int(7)]).unwrap();
        let handle = vm.new_handle(closure);
        vm.collect_garbage(false);
        assert_eq!(vm.regs.closure, Value::Undefined);
        let closure = vm.handle_value(&handle).unwrap();
        assert_eq!(vm.call(closure, &[]).unwrap(), Value::Int(7));
    }

    #[test]
    fn calling_a_non_function_is_a_type_error() {
        let image = ImageBuilder::new().build();
        let mut vm = Vm::restore(&image, |_| None).unwrap();
        assert!(matches!(vm.call(Value::Int(3), &[]), Err(Error::TypeError(_))));
        assert_eq!(vm.call(Value::NoOpFunction, &[]).unwrap(), Value::Undefined);
    }
}
