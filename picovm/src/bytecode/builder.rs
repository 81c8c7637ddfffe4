use super::instruction::Instruction;
use super::op::{BitOp, Ex1, Ex2, Ex3, Ex4, NumOp, Op, SmallLiteral};
use crate::header::{Header, MAX_FUNCTION_SIZE};
use crate::image::builder::Operand;
use crate::value::Value;

/// A jump target. Create with [`FunctionBuilder::new_label`], place with
/// [`FunctionBuilder::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct PendingJump {
    /// Position of the i16 offset bytes in the code.
    offset_pos: usize,
    /// Position right after the jump instruction (base for the offset).
    base: usize,
    label: Label,
}

/// A finished function body: `[maxStackDepth, code...]` plus the
/// positions of literal operands that reference image items.
#[derive(Debug, Clone)]
pub struct FunctionCode {
    pub body: Vec<u8>,
    pub fixups: Vec<(usize, Operand)>,
}

/// Builds the body of one bytecode function.
///
/// Operand widths are picked automatically. The builder tracks the operand
/// stack depth linearly to fill in the function's maximum stack depth.
#[derive(Debug, Default)]
pub struct FunctionBuilder {
    code: Vec<u8>,
    depth: usize,
    max_depth: usize,
    labels: Vec<Option<usize>>,
    jumps: Vec<PendingJump>,
    /// `StartTry` operands, patched with the body-relative handler offset.
    handlers: Vec<(usize, Label)>,
    fixups: Vec<(usize, Operand)>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current code offset.
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.code.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_primary(&mut self, op: Op, low: u8) {
        debug_assert!(low < 16);
        self.code.push(((op as u8) << 4) | low);
    }

    fn emit_ex1(&mut self, ex: Ex1) {
        self.emit_primary(Op::Extended1, ex as u8);
    }

    fn emit_ex2(&mut self, ex: Ex2, operand: u8) {
        self.emit_primary(Op::Extended2, ex as u8);
        self.emit_u8(operand);
    }

    fn emit_ex3(&mut self, ex: Ex3, operand: u16) {
        self.emit_primary(Op::Extended3, ex as u8);
        self.emit_u16(operand);
    }

    fn emit_ex4(&mut self, ex: Ex4) {
        self.emit_ex2(Ex2::Extended4, ex as u8);
    }

    /// Nibble form if `index < 16`, otherwise the `u8` form of group 2.
    fn emit_indexed(&mut self, narrow: Op, wide: Ex2, index: u16) {
        if index < 16 {
            self.emit_primary(narrow, index as u8);
        } else {
            let index = u8::try_from(index).expect("operand index exceeds u8");
            self.emit_ex2(wide, index);
        }
    }

    fn effect(&mut self, instruction: Instruction) {
        let (pops, pushes) = instruction.stack_effect();
        self.adjust(pops, pushes);
    }

    fn adjust(&mut self, pops: usize, pushes: usize) {
        self.depth = self.depth.saturating_sub(pops) + pushes;
        self.max_depth = self.max_depth.max(self.depth);
    }

    // ── loads and stores ───────────────────────────────────────────

    /// Push a literal. Well-known constants and small ints use the one-byte
    /// form; image references are patched when the image is laid out.
    pub fn load_literal(&mut self, operand: impl Into<Operand>) {
        let operand = operand.into();
        match operand {
            Operand::Value(value) => match small_literal(value) {
                Some(lit) => self.emit_primary(Op::LoadSmallLiteral, lit as u8),
                None => self.emit_ex3(Ex3::LoadLiteral, value.encode()),
            },
            _ => {
                self.emit_primary(Op::Extended3, Ex3::LoadLiteral as u8);
                self.fixups.push((self.code.len(), operand));
                self.emit_u16(0);
            }
        }
        self.adjust(0, 1);
    }

    pub fn load_int(&mut self, value: i16) {
        self.load_literal(Value::Int(value));
    }

    pub fn load_var(&mut self, index: u16) {
        self.emit_indexed(Op::LoadVar1, Ex2::LoadVar2, index);
        self.adjust(0, 1);
    }

    pub fn load_scoped(&mut self, index: u16) {
        self.emit_indexed(Op::LoadScoped1, Ex2::LoadScoped2, index);
        self.adjust(0, 1);
    }

    pub fn load_arg(&mut self, index: u16) {
        self.emit_indexed(Op::LoadArg1, Ex2::LoadArg2, index);
        self.adjust(0, 1);
    }

    pub fn load_global(&mut self, index: u16) {
        self.emit_ex3(Ex3::LoadGlobal, index);
        self.adjust(0, 1);
    }

    pub fn store_var(&mut self, index: u16) {
        self.emit_indexed(Op::StoreVar1, Ex2::StoreVar2, index);
        self.adjust(1, 0);
    }

    pub fn store_scoped(&mut self, index: u16) {
        self.emit_indexed(Op::StoreScoped1, Ex2::StoreScoped2, index);
        self.adjust(1, 0);
    }

    pub fn store_arg(&mut self, index: u8) {
        self.emit_ex2(Ex2::StoreArg, index);
        self.adjust(1, 0);
    }

    pub fn store_global(&mut self, index: u16) {
        self.emit_ex3(Ex3::StoreGlobal, index);
        self.adjust(1, 0);
    }

    // ── calls ──────────────────────────────────────────────────────

    /// `[func, this, args...] -> [result]`, `argc` counts `this`.
    pub fn call(&mut self, argc: u8) {
        if argc < 16 {
            self.emit_primary(Op::Call1, argc);
        } else {
            self.emit_ex2(Ex2::Call2, argc);
        }
        self.effect(Instruction::Call { argc, void: false });
    }

    pub fn call_void(&mut self, argc: u8) {
        self.emit_ex2(Ex2::CallVoid, argc);
        self.effect(Instruction::Call { argc, void: true });
    }

    /// `[this, args...] -> [result]` through short-call table entry `index`
    /// whose argument count is `argc`.
    pub fn call_short(&mut self, index: u8, argc: u8) {
        assert!(index < 16, "short-call index must fit a nibble");
        self.emit_primary(Op::CallShort, index);
        self.adjust(argc as usize, 1);
    }

    /// `[this, args...] -> [result]` calling import `import` directly.
    pub fn call_host(&mut self, import: u8, argc: u8) {
        self.emit_ex3(Ex3::CallHost, import as u16 | (argc as u16) << 8);
        self.effect(Instruction::CallHost { import, argc });
    }

    /// `[class, args...] -> [object]`, `argc` excludes `this`.
    pub fn new_object_of(&mut self, argc: u8) {
        self.emit_ex2(Ex2::New, argc);
        self.effect(Instruction::New { argc });
    }

    pub fn return_(&mut self) {
        self.emit_ex1(Ex1::Return);
        self.adjust(1, 0);
    }

    pub fn throw(&mut self) {
        self.emit_ex1(Ex1::Throw);
        self.adjust(1, 0);
    }

    // ── control flow ───────────────────────────────────────────────

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Place `label` at the current offset.
    pub fn bind(&mut self, label: Label) {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
    }

    fn emit_jump(&mut self, ex: Ex3, label: Label) {
        self.emit_primary(Op::Extended3, ex as u8);
        let offset_pos = self.code.len();
        self.emit_u16(0);
        self.jumps.push(PendingJump {
            offset_pos,
            base: self.code.len(),
            label,
        });
    }

    pub fn jump(&mut self, label: Label) {
        self.emit_jump(Ex3::Jump2, label);
    }

    /// Pop the condition, jump to `label` if it is truthy.
    pub fn branch(&mut self, label: Label) {
        self.emit_jump(Ex3::Branch2, label);
        self.adjust(1, 0);
    }

    /// Push a catch record whose handler is at `handler`.
    pub fn start_try(&mut self, handler: Label) {
        self.emit_primary(Op::Extended3, Ex3::StartTry as u8);
        self.handlers.push((self.code.len(), handler));
        self.emit_u16(0);
        self.adjust(0, 2);
    }

    pub fn end_try(&mut self) {
        self.emit_ex1(Ex1::EndTry);
        self.adjust(2, 0);
    }

    /// The handler starts with the exception on the stack in place of the
    /// catch record. Call this right after binding the handler label.
    pub fn enter_handler(&mut self) {
        self.depth = self.depth.saturating_sub(2) + 1;
        self.max_depth = self.max_depth.max(self.depth);
    }

    pub fn pop(&mut self) {
        self.emit_ex1(Ex1::Pop);
        self.adjust(1, 0);
    }

    pub fn pop_n(&mut self, count: u16) {
        self.emit_ex3(Ex3::PopN, count);
        self.adjust(count as usize, 0);
    }

    // ── scopes ─────────────────────────────────────────────────────

    pub fn scope_new(&mut self, slots: u16) {
        self.emit_ex3(Ex3::ScopeNew, slots);
    }

    pub fn scope_pop(&mut self) {
        self.emit_ex1(Ex1::ScopePop);
    }

    pub fn scope_clone(&mut self) {
        self.emit_ex1(Ex1::ScopeClone);
    }

    pub fn closure_new(&mut self) {
        self.emit_ex1(Ex1::ClosureNew);
        self.adjust(1, 1);
    }

    // ── objects ────────────────────────────────────────────────────

    pub fn object_new(&mut self) {
        self.emit_ex1(Ex1::ObjectNew);
        self.adjust(0, 1);
    }

    pub fn object_get(&mut self) {
        self.emit_ex1(Ex1::ObjectGet);
        self.adjust(2, 1);
    }

    pub fn object_set(&mut self) {
        self.emit_ex1(Ex1::ObjectSet);
        self.adjust(3, 0);
    }

    pub fn object_get_key(&mut self, key: impl Into<Operand>) {
        self.emit_keyed(Ex3::ObjectGetKey, key.into());
        self.adjust(1, 1);
    }

    pub fn object_set_key(&mut self, key: impl Into<Operand>) {
        self.emit_keyed(Ex3::ObjectSetKey, key.into());
        self.adjust(2, 0);
    }

    fn emit_keyed(&mut self, ex: Ex3, key: Operand) {
        match key {
            Operand::Value(value) => self.emit_ex3(ex, value.encode()),
            _ => {
                self.emit_primary(Op::Extended3, ex as u8);
                self.fixups.push((self.code.len(), key));
                self.emit_u16(0);
            }
        }
    }

    pub fn object_keys(&mut self) {
        self.emit_ex4(Ex4::ObjectKeys);
    }

    pub fn array_new(&mut self, capacity: u8) {
        self.emit_ex2(Ex2::ArrayNew, capacity);
        self.adjust(0, 1);
    }

    pub fn array_get(&mut self, index: u16) {
        self.emit_indexed(Op::ArrayGet1, Ex2::ArrayGet2, index);
    }

    /// `[array, value] -> []`
    pub fn array_set(&mut self, index: u16) {
        self.emit_indexed(Op::ArraySet1, Ex2::ArraySet2, index);
        self.adjust(2, 0);
    }

    pub fn fixed_array_new(&mut self, length: u16) {
        if length < 16 {
            self.emit_primary(Op::FixedArrayNew1, length as u8);
        } else {
            let length = u8::try_from(length).expect("fixed array length exceeds u8");
            self.emit_ex2(Ex2::FixedArrayNew2, length);
        }
        self.adjust(0, 1);
    }

    pub fn uint8_array_new(&mut self) {
        self.emit_ex4(Ex4::Uint8ArrayNew);
    }

    pub fn class_create(&mut self) {
        self.emit_ex4(Ex4::ClassCreate);
        self.adjust(2, 1);
    }

    // ── operators ──────────────────────────────────────────────────

    pub fn num_op(&mut self, op: NumOp) {
        self.emit_primary(Op::NumOp, op as u8);
        self.effect(Instruction::NumOp(op));
    }

    pub fn bit_op(&mut self, op: BitOp) {
        self.emit_primary(Op::BitOp, op as u8);
        self.effect(Instruction::BitOp(op));
    }

    pub fn add(&mut self) {
        self.emit_ex1(Ex1::Add);
        self.adjust(2, 1);
    }

    pub fn equal(&mut self) {
        self.emit_ex1(Ex1::Equal);
        self.adjust(2, 1);
    }

    pub fn not_equal(&mut self) {
        self.emit_ex1(Ex1::NotEqual);
        self.adjust(2, 1);
    }

    pub fn logical_not(&mut self) {
        self.emit_ex1(Ex1::LogicalNot);
    }

    pub fn type_of(&mut self) {
        self.emit_ex1(Ex1::TypeOf);
    }

    pub fn type_code_of(&mut self) {
        self.emit_ex1(Ex1::TypeCodeOf);
    }

    pub fn nop(&mut self) {
        self.emit_ex4(Ex4::Nop);
    }

    // ── async ──────────────────────────────────────────────────────

    /// Must be the first instruction of an async function. `slots` is the
    /// activation closure size: 4 bookkeeping slots, the function's own
    /// scoped variables, room for the stack saved at each await, and the
    /// parent slot.
    pub fn async_start(&mut self, slots: u16) {
        self.emit_ex3(Ex3::AsyncStart, slots);
        self.adjust(0, 2);
    }

    /// Await the value on top of the stack. Emits the `Await`, the
    /// continuation stub and the `AsyncResume` that continues with the
    /// awaited result on the stack.
    pub fn await_(&mut self) {
        self.emit_ex4(Ex4::Await);
        self.adjust(1, 0);
        self.emit_await_stub();
    }

    /// `[func, this, args...] -> [result]`, offering the current activation
    /// as the callee's continuation, then await the result.
    pub fn await_call(&mut self, argc: u8) {
        self.emit_ex3(Ex3::AwaitCall, argc as u16);
        self.effect(Instruction::AwaitCall { argc });
        self.await_();
    }

    fn emit_await_stub(&mut self) {
        // Body offsets are code offsets + 1 (the max-stack byte), and
        // function bodies are 4-aligned, so body-relative alignment is
        // absolute alignment.
        while (self.code.len() + 1) % 4 != 2 {
            self.emit_u8(0);
        }
        let continuation_body = self.code.len() + 1 + 2;
        self.emit_u16(Header::continuation(continuation_body).0);
        self.emit_ex4(Ex4::AsyncResume);
        self.adjust(0, 1);
    }

    pub fn async_return(&mut self) {
        self.emit_ex4(Ex4::AsyncReturn);
        self.adjust(1, 0);
    }

    /// `[target, isSuccess, result] -> []`
    pub fn async_complete(&mut self) {
        self.emit_ex4(Ex4::AsyncComplete);
        self.adjust(3, 0);
    }

    /// Resolve labels and produce the function body.
    pub fn finish(mut self) -> FunctionCode {
        for jump in &self.jumps {
            let target = self.labels[jump.label.0].expect("jump to unbound label");
            let offset = i16::try_from(target as isize - jump.base as isize)
                .expect("jump offset exceeds i16");
            self.code[jump.offset_pos..jump.offset_pos + 2].copy_from_slice(&offset.to_le_bytes());
        }
        for &(pos, label) in &self.handlers {
            let target = self.labels[label.0].expect("try handler label unbound");
            let body_offset = (target + 1) as u16;
            self.code[pos..pos + 2].copy_from_slice(&body_offset.to_le_bytes());
        }

        let mut body = Vec::with_capacity(self.code.len() + 1);
        body.push(u8::try_from(self.max_depth).unwrap_or(u8::MAX));
        body.extend_from_slice(&self.code);
        assert!(body.len() <= MAX_FUNCTION_SIZE, "function body too large");

        let fixups = self
            .fixups
            .into_iter()
            .map(|(pos, operand)| (pos + 1, operand))
            .collect();
        FunctionCode { body, fixups }
    }
}

fn small_literal(value: Value) -> Option<SmallLiteral> {
    Some(match value {
        Value::Undefined => SmallLiteral::Undefined,
        Value::Null => SmallLiteral::Null,
        Value::True => SmallLiteral::True,
        Value::False => SmallLiteral::False,
        Value::NaN => SmallLiteral::NaN,
        Value::Deleted => SmallLiteral::Deleted,
        Value::Int(-1) => SmallLiteral::MinusOne,
        Value::Int(0) => SmallLiteral::Zero,
        Value::Int(1) => SmallLiteral::One,
        Value::Int(2) => SmallLiteral::Two,
        Value::Int(3) => SmallLiteral::Three,
        Value::Int(4) => SmallLiteral::Four,
        Value::Int(5) => SmallLiteral::Five,
        _ => return None,
    })
}

/// Value pushed by a small literal.
pub fn small_literal_value(lit: SmallLiteral) -> Value {
    match lit {
        SmallLiteral::Undefined => Value::Undefined,
        SmallLiteral::Null => Value::Null,
        SmallLiteral::True => Value::True,
        SmallLiteral::False => Value::False,
        SmallLiteral::NaN => Value::NaN,
        SmallLiteral::Deleted => Value::Deleted,
        SmallLiteral::MinusOne => Value::Int(-1),
        SmallLiteral::Zero => Value::Int(0),
        SmallLiteral::One => Value::Int(1),
        SmallLiteral::Two => Value::Int(2),
        SmallLiteral::Three => Value::Int(3),
        SmallLiteral::Four => Value::Int(4),
        SmallLiteral::Five => Value::Int(5),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::decoder::BytecodeDecoder;

    fn decode_all(body: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::with_range(body, 1, body.len())
            .map(|r| r.map(|(_, i)| i))
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn add_function_roundtrip() {
        let mut f = FunctionBuilder::new();
        f.load_arg(1);
        f.load_arg(2);
        f.add();
        f.return_();
        let code = f.finish();
        assert_eq!(code.body[0], 2, "max stack depth");
        assert_eq!(
            decode_all(&code.body),
            vec![
                Instruction::LoadArg { index: 1 },
                Instruction::LoadArg { index: 2 },
                Instruction::Add,
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn literals_pick_narrow_forms() {
        let mut f = FunctionBuilder::new();
        f.load_literal(Value::Int(3));
        f.load_literal(Value::Int(300));
        f.load_literal(Value::Null);
        let code = f.finish();
        assert_eq!(code.body.len(), 1 + 1 + 3 + 1);
        assert_eq!(
            decode_all(&code.body),
            vec![
                Instruction::LoadSmallLiteral(SmallLiteral::Three),
                Instruction::LoadLiteral {
                    raw: Value::Int(300).encode()
                },
                Instruction::LoadSmallLiteral(SmallLiteral::Null),
            ]
        );
    }

    #[test]
    fn forward_jump() {
        let mut f = FunctionBuilder::new();
        let end = f.new_label();
        f.load_literal(Value::True);
        f.branch(end);
        f.load_int(1);
        f.pop();
        f.bind(end);
        f.load_int(2);
        f.return_();
        let code = f.finish();
        let instrs = decode_all(&code.body);
        assert_eq!(instrs[1], Instruction::Branch { offset: 2 });
    }

    #[test]
    fn try_handler_offset_is_body_relative() {
        let mut f = FunctionBuilder::new();
        let handler = f.new_label();
        f.start_try(handler);
        f.end_try();
        f.bind(handler);
        f.return_();
        let code = f.finish();
        // StartTry (3) + EndTry (1) = 4 code bytes, +1 for the depth byte.
        assert_eq!(decode_all(&code.body)[0], Instruction::StartTry { catch_offset: 5 });
    }

    #[test]
    fn await_stub_aligns_continuation() {
        let mut f = FunctionBuilder::new();
        f.async_start(6);
        f.load_int(1);
        f.await_();
        f.async_return();
        let code = f.finish();
        let instrs = decode_all(&code.body);
        assert_eq!(
            instrs,
            vec![
                Instruction::AsyncStart { slots: 6 },
                Instruction::LoadSmallLiteral(SmallLiteral::One),
                Instruction::Await,
                Instruction::AsyncResume,
                Instruction::AsyncReturn,
            ]
        );
        // AsyncStart(3) + literal(1) + Await(2) ends at body offset 7; the
        // continuation header sits at 10, its body at 12.
        let header = Header(u16::from_le_bytes([code.body[10], code.body[11]]));
        assert!(header.is_continuation());
        assert_eq!(header.continuation_back_offset(), 12);
    }
}
