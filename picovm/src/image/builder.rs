//! Image assembler.
//!
//! Lays out already-decided bytecode and data into a loadable image. Items
//! are referenced symbolically through [`Operand`] until [`ImageBuilder::build`]
//! assigns offsets.
use std::collections::HashMap;

use super::format::{
    BUILTIN_COUNT, BYTECODE_VERSION, Builtin, ENGINE_VERSION, FeatureFlags, HEADER_SIZE,
    SECTION_COUNT, Section, seal, write_u16,
};
use crate::bytecode::builder::{FunctionBuilder, FunctionCode};
use crate::header::{Header, footprint};
use crate::interning::immediate_key;
use crate::value::{HeapPtr, RomPtr, TypeCode, Value};

/// A value as seen while the image is being assembled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Value(Value),
    /// ROM item, by index.
    Rom(usize),
    /// Handle to a global slot.
    Global(u16),
    /// Initial heap item, by index. Only heap items and globals may refer to
    /// these directly; anywhere else the builder routes them through a handle.
    Heap(usize),
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Value(value)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ShortCallTarget {
    Function(Operand),
    Host { import: u8 },
}

#[derive(Debug)]
enum RomItem {
    /// `None` while declared but not yet defined.
    Function(Option<FunctionCode>),
    String(Vec<u8>),
    Int32(i32),
    Float64(f64),
    HostFunc(u16),
    Object {
        proto: Operand,
        props: Vec<(Operand, Operand)>,
    },
    Class {
        constructor: Operand,
        statics: Operand,
    },
}

#[derive(Debug)]
enum HeapItem {
    Object {
        proto: Operand,
        props: Vec<(Operand, Operand)>,
    },
    Array {
        data: Option<usize>,
        length: usize,
    },
    FixedArray(Vec<Operand>),
    Closure(Vec<Operand>),
    String(Vec<u8>),
    Int32(i32),
    Float64(f64),
    Uint8Array(Vec<u8>),
}

impl RomItem {
    fn type_code(&self) -> TypeCode {
        match self {
            RomItem::Function(_) => TypeCode::Function,
            RomItem::String(_) => TypeCode::InternedString,
            RomItem::Int32(_) => TypeCode::Int32,
            RomItem::Float64(_) => TypeCode::Float64,
            RomItem::HostFunc(_) => TypeCode::HostFunc,
            RomItem::Object { .. } => TypeCode::PropertyList,
            RomItem::Class { .. } => TypeCode::Class,
        }
    }

    fn size(&self) -> usize {
        match self {
            RomItem::Function(code) => code.as_ref().map_or(0, |code| code.body.len()),
            RomItem::String(bytes) => bytes.len(),
            RomItem::Int32(_) => 4,
            RomItem::Float64(_) => 8,
            RomItem::HostFunc(_) => 2,
            RomItem::Object { props, .. } => 4 + 4 * props.len(),
            RomItem::Class { .. } => 4,
        }
    }
}

impl HeapItem {
    fn type_code(&self) -> TypeCode {
        match self {
            HeapItem::Object { .. } => TypeCode::PropertyList,
            HeapItem::Array { .. } => TypeCode::Array,
            HeapItem::FixedArray(_) => TypeCode::FixedLengthArray,
            HeapItem::Closure(_) => TypeCode::Closure,
            HeapItem::String(_) => TypeCode::String,
            HeapItem::Int32(_) => TypeCode::Int32,
            HeapItem::Float64(_) => TypeCode::Float64,
            HeapItem::Uint8Array(_) => TypeCode::Uint8Array,
        }
    }

    fn size(&self) -> usize {
        match self {
            HeapItem::Object { props, .. } => 4 + 4 * props.len(),
            HeapItem::Array { .. } => 4,
            HeapItem::FixedArray(slots) | HeapItem::Closure(slots) => 2 * slots.len(),
            HeapItem::String(bytes) | HeapItem::Uint8Array(bytes) => bytes.len(),
            HeapItem::Int32(_) => 4,
            HeapItem::Float64(_) => 8,
        }
    }
}

/// Offsets assigned by the layout pass.
struct Layout {
    rom: Vec<usize>,
    heap: Vec<usize>,
    globals_start: usize,
}

impl Layout {
    fn resolve(&self, operand: Operand) -> Value {
        match operand {
            Operand::Value(value) => value,
            Operand::Rom(index) => Value::Rom(RomPtr(self.rom[index] as u16)),
            Operand::Global(index) => {
                Value::Rom(RomPtr((self.globals_start + 2 * index as usize) as u16))
            }
            Operand::Heap(index) => Value::Ptr(HeapPtr(self.heap[index] as u16)),
        }
    }
}

#[derive(Debug)]
pub struct ImageBuilder {
    imports: Vec<u16>,
    exports: Vec<(u16, Operand)>,
    short_calls: Vec<(ShortCallTarget, u8)>,
    builtins: [Option<Operand>; BUILTIN_COUNT],
    rom: Vec<RomItem>,
    interned: HashMap<Vec<u8>, usize>,
    globals: Vec<Operand>,
    heap: Vec<HeapItem>,
    features: FeatureFlags,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            imports: Vec::new(),
            exports: Vec::new(),
            short_calls: Vec::new(),
            builtins: [None; BUILTIN_COUNT],
            rom: Vec::new(),
            interned: HashMap::new(),
            globals: Vec::new(),
            heap: Vec::new(),
            features: FeatureFlags::FLOAT_SUPPORT,
        }
    }

    /// Route heap references through a handle so read-only data can hold them.
    fn rom_safe(&mut self, operand: Operand) -> Operand {
        match operand {
            Operand::Heap(_) => self.handle(operand),
            other => other,
        }
    }

    // ── tables ─────────────────────────────────────────────────────

    /// Add an import and return its index in the import table.
    pub fn import(&mut self, host_function_id: u16) -> u8 {
        if let Some(index) = self.imports.iter().position(|&id| id == host_function_id) {
            return index as u8;
        }
        self.imports.push(host_function_id);
        (self.imports.len() - 1) as u8
    }

    /// A callable value for import `import`.
    pub fn host_function(&mut self, import: u8) -> Operand {
        self.push_rom(RomItem::HostFunc(import as u16))
    }

    pub fn export(&mut self, id: u16, value: impl Into<Operand>) {
        let value = self.rom_safe(value.into());
        self.exports.push((id, value));
    }

    pub fn short_call(&mut self, target: ShortCallTarget, argc: u8) -> u8 {
        let target = match target {
            ShortCallTarget::Function(f) => ShortCallTarget::Function(self.rom_safe(f)),
            host => host,
        };
        self.short_calls.push((target, argc));
        (self.short_calls.len() - 1) as u8
    }

    pub fn set_builtin(&mut self, builtin: Builtin, value: impl Into<Operand>) {
        let value = self.rom_safe(value.into());
        self.builtins[builtin as usize] = Some(value);
    }

    // ── ROM ────────────────────────────────────────────────────────

    fn push_rom(&mut self, item: RomItem) -> Operand {
        self.rom.push(item);
        Operand::Rom(self.rom.len() - 1)
    }

    /// An interned string in ROM, listed in the string table.
    pub fn string(&mut self, s: &str) -> Operand {
        match s {
            "length" => return Operand::Value(Value::StrLength),
            "__proto__" => return Operand::Value(Value::StrProto),
            _ => {}
        }
        if let Some(&index) = self.interned.get(s.as_bytes()) {
            return Operand::Rom(index);
        }
        let operand = self.push_rom(RomItem::String(s.as_bytes().to_vec()));
        if let Operand::Rom(index) = operand {
            self.interned.insert(s.as_bytes().to_vec(), index);
        }
        operand
    }

    /// A number constant: int14 inline, otherwise boxed in ROM.
    pub fn number(&mut self, n: f64) -> Operand {
        if n.is_nan() {
            return Operand::Value(Value::NaN);
        }
        if n == 0.0 && n.is_sign_negative() {
            return Operand::Value(Value::NegZero);
        }
        if n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64 {
            let i = n as i32;
            return match Value::int14(i) {
                Some(value) => Operand::Value(value),
                None => self.push_rom(RomItem::Int32(i)),
            };
        }
        self.push_rom(RomItem::Float64(n))
    }

    /// Reserve a function so it can be referenced before its body exists.
    pub fn declare_function(&mut self) -> Operand {
        self.push_rom(RomItem::Function(None))
    }

    pub fn define_function(&mut self, declared: Operand, function: FunctionBuilder) {
        let Operand::Rom(index) = declared else {
            panic!("define_function needs a declared function");
        };
        let mut code = function.finish();
        let fixups = std::mem::take(&mut code.fixups);
        code.fixups = fixups
            .into_iter()
            .map(|(pos, operand)| (pos, self.rom_safe(operand)))
            .collect();
        self.rom[index] = RomItem::Function(Some(code));
    }

    pub fn function(&mut self, function: FunctionBuilder) -> Operand {
        let declared = self.declare_function();
        self.define_function(declared, function);
        declared
    }

    /// A read-only object in ROM.
    pub fn rom_object(&mut self, proto: Operand, props: &[(Operand, Operand)]) -> Operand {
        let proto = self.rom_safe(proto);
        let props = props
            .iter()
            .map(|&(k, v)| (self.property_key(k), self.rom_safe(v)))
            .collect();
        self.push_rom(RomItem::Object { proto, props })
    }

    /// Object literal keys are stored canonically: integer strings become
    /// int keys.
    fn property_key(&self, key: Operand) -> Operand {
        if let Operand::Rom(index) = key
            && let Some(RomItem::String(bytes)) = self.rom.get(index)
            && let Some(value) = immediate_key(bytes)
        {
            return Operand::Value(value);
        }
        key
    }

    pub fn rom_class(&mut self, constructor: Operand, statics: Operand) -> Operand {
        let constructor = self.rom_safe(constructor);
        let statics = self.rom_safe(statics);
        self.push_rom(RomItem::Class {
            constructor,
            statics,
        })
    }

    // ── globals ────────────────────────────────────────────────────

    pub fn global(&mut self, initial: impl Into<Operand>) -> u16 {
        self.globals.push(initial.into());
        (self.globals.len() - 1) as u16
    }

    /// A global addressable by a handle. Handles must be 4-byte aligned, so
    /// the global lands on an even index.
    pub fn handle(&mut self, initial: impl Into<Operand>) -> Operand {
        if self.globals.len() % 2 != 0 {
            self.globals.push(Operand::Value(Value::Undefined));
        }
        Operand::Global(self.global(initial))
    }

    // ── initial heap ───────────────────────────────────────────────

    fn push_heap(&mut self, item: HeapItem) -> Operand {
        self.heap.push(item);
        Operand::Heap(self.heap.len() - 1)
    }

    pub fn heap_object(&mut self, proto: Operand, props: &[(Operand, Operand)]) -> Operand {
        let props = props
            .iter()
            .map(|&(k, v)| (self.property_key(k), v))
            .collect();
        self.push_heap(HeapItem::Object { proto, props })
    }

    pub fn heap_array(&mut self, items: &[Operand]) -> Operand {
        let data = if items.is_empty() {
            None
        } else {
            match self.push_heap(HeapItem::FixedArray(items.to_vec())) {
                Operand::Heap(index) => Some(index),
                _ => None,
            }
        };
        self.push_heap(HeapItem::Array {
            data,
            length: items.len(),
        })
    }

    pub fn heap_closure(&mut self, slots: &[Operand]) -> Operand {
        self.push_heap(HeapItem::Closure(slots.to_vec()))
    }

    pub fn heap_string(&mut self, s: &str) -> Operand {
        self.push_heap(HeapItem::String(s.as_bytes().to_vec()))
    }

    pub fn heap_int32(&mut self, i: i32) -> Operand {
        self.push_heap(HeapItem::Int32(i))
    }

    pub fn heap_float64(&mut self, n: f64) -> Operand {
        self.push_heap(HeapItem::Float64(n))
    }

    pub fn heap_uint8_array(&mut self, bytes: &[u8]) -> Operand {
        self.push_heap(HeapItem::Uint8Array(bytes.to_vec()))
    }

    // ── output ─────────────────────────────────────────────────────

    fn add_async_builtins(&mut self) {
        if self.builtins[Builtin::AsyncContinue as usize].is_none() {
            // Job closure: [fn, subscriber, isSuccess, result, parent]
            let mut f = FunctionBuilder::new();
            f.load_scoped(1);
            f.load_literal(Value::Undefined);
            f.load_scoped(2);
            f.load_scoped(3);
            f.call_void(3);
            f.load_literal(Value::Undefined);
            f.return_();
            let function = self.function(f);
            self.builtins[Builtin::AsyncContinue as usize] = Some(function);
        }
        if self.builtins[Builtin::AsyncHostCallback as usize].is_none() {
            // Host callback closure: [fn, target, parent]
            let mut f = FunctionBuilder::new();
            f.load_scoped(1);
            f.load_arg(1);
            f.load_arg(2);
            f.async_complete();
            f.load_literal(Value::Undefined);
            f.return_();
            let function = self.function(f);
            self.builtins[Builtin::AsyncHostCallback as usize] = Some(function);
        }
        if self.builtins[Builtin::PromiseProto as usize].is_none() {
            let proto = self.rom_object(Operand::Value(Value::Null), &[]);
            self.builtins[Builtin::PromiseProto as usize] = Some(proto);
        }
        if self.builtins[Builtin::InternedStrings as usize].is_none() {
            let list = self.handle(Value::Null);
            self.builtins[Builtin::InternedStrings as usize] = Some(list);
        }
    }

    fn layout(&self, rom_start: usize) -> (Layout, usize) {
        let mut rom = Vec::with_capacity(self.rom.len());
        let mut pos = rom_start;
        for item in &self.rom {
            while (pos + 2) % 4 != 0 {
                pos += 1;
            }
            rom.push(pos + 2);
            pos += 2 + item.size();
        }
        let globals_start = (pos + 3) & !3;

        let mut heap = Vec::with_capacity(self.heap.len());
        let mut cursor = 0;
        for item in &self.heap {
            heap.push(cursor + 2);
            cursor += footprint(item.size());
        }
        (
            Layout {
                rom,
                heap,
                globals_start,
            },
            pos,
        )
    }

    /// Assemble the image.
    pub fn build(mut self) -> Vec<u8> {
        self.add_async_builtins();

        let mut strings: Vec<usize> = self.interned.values().copied().collect();
        strings.sort_by(|&a, &b| match (&self.rom[a], &self.rom[b]) {
            (RomItem::String(x), RomItem::String(y)) => x.cmp(y),
            _ => a.cmp(&b),
        });

        let mut offsets = [0usize; SECTION_COUNT];
        let mut pos = HEADER_SIZE;
        offsets[Section::Import as usize] = pos;
        pos += 2 * self.imports.len();
        offsets[Section::Export as usize] = pos;
        pos += 4 * self.exports.len();
        offsets[Section::ShortCallTable as usize] = pos;
        pos += 4 * self.short_calls.len();
        offsets[Section::Builtins as usize] = pos;
        pos += 2 * BUILTIN_COUNT;
        offsets[Section::StringTable as usize] = pos;
        pos += 2 * strings.len();
        offsets[Section::Rom as usize] = pos;

        let (layout, rom_end) = self.layout(pos);
        offsets[Section::Globals as usize] = layout.globals_start;
        let heap_start = layout.globals_start + 2 * self.globals.len();
        offsets[Section::Heap as usize] = heap_start;
        let heap_size = self
            .heap
            .iter()
            .map(|item| footprint(item.size()))
            .sum::<usize>();
        let total = heap_start + heap_size;
        assert!(total <= u16::MAX as usize, "image exceeds 64 KB");

        let mut image = vec![0u8; total];
        image[0] = BYTECODE_VERSION;
        image[1] = HEADER_SIZE as u8;
        image[2] = ENGINE_VERSION;
        image[8..12].copy_from_slice(&self.features.bits().to_le_bytes());
        for (i, offset) in offsets.iter().enumerate() {
            write_u16(&mut image, 12 + 2 * i, *offset as u16);
        }

        let mut at = offsets[Section::Import as usize];
        for &id in &self.imports {
            write_u16(&mut image, at, id);
            at += 2;
        }
        for &(id, value) in &self.exports {
            write_u16(&mut image, at, id);
            write_u16(&mut image, at + 2, layout.resolve(value).encode());
            at += 4;
        }
        for &(target, argc) in &self.short_calls {
            let raw = match target {
                ShortCallTarget::Function(f) => match layout.resolve(f) {
                    Value::Rom(RomPtr(offset)) => offset,
                    _ => panic!("short-call target must be a ROM function"),
                },
                ShortCallTarget::Host { import } => ((import as u16) << 1) | 1,
            };
            write_u16(&mut image, at, raw);
            image[at + 2] = argc;
            at += 4;
        }
        for builtin in &self.builtins {
            let value = builtin.map_or(Value::Undefined, |b| layout.resolve(b));
            write_u16(&mut image, at, value.encode());
            at += 2;
        }
        for &index in &strings {
            write_u16(&mut image, at, layout.rom[index] as u16);
            at += 2;
        }

        for (item, &body) in self.rom.iter().zip(&layout.rom) {
            let header = Header::new(item.type_code(), item.size());
            write_u16(&mut image, body - 2, header.0);
            let out = &mut image[body..body + item.size()];
            match item {
                RomItem::Function(Some(code)) => {
                    out.copy_from_slice(&code.body);
                    for &(pos, operand) in &code.fixups {
                        let raw = layout.resolve(operand).encode();
                        out[pos..pos + 2].copy_from_slice(&raw.to_le_bytes());
                    }
                }
                RomItem::Function(None) => panic!("function declared but never defined"),
                RomItem::String(bytes) => out.copy_from_slice(bytes),
                RomItem::Int32(i) => out.copy_from_slice(&i.to_le_bytes()),
                RomItem::Float64(n) => out.copy_from_slice(&n.to_le_bytes()),
                RomItem::HostFunc(import) => out.copy_from_slice(&import.to_le_bytes()),
                RomItem::Object { proto, props } => {
                    let mut slots = vec![Value::Null, layout.resolve(*proto)];
                    for &(k, v) in props {
                        slots.push(layout.resolve(k));
                        slots.push(layout.resolve(v));
                    }
                    write_slots(out, &slots);
                }
                RomItem::Class {
                    constructor,
                    statics,
                } => write_slots(
                    out,
                    &[layout.resolve(*constructor), layout.resolve(*statics)],
                ),
            }
        }
        debug_assert!(rom_end <= layout.globals_start);

        for (i, &global) in self.globals.iter().enumerate() {
            write_u16(
                &mut image,
                layout.globals_start + 2 * i,
                layout.resolve(global).encode(),
            );
        }

        for (item, &body) in self.heap.iter().zip(&layout.heap) {
            let at = heap_start + body;
            let header = Header::new(item.type_code(), item.size());
            write_u16(&mut image, at - 2, header.0);
            let out = &mut image[at..at + item.size()];
            match item {
                HeapItem::Object { proto, props } => {
                    let mut slots = vec![Value::Null, layout.resolve(*proto)];
                    for &(k, v) in props {
                        slots.push(layout.resolve(k));
                        slots.push(layout.resolve(v));
                    }
                    write_slots(out, &slots);
                }
                HeapItem::Array { data, length } => {
                    let data = data.map_or(Value::Null, |d| layout.resolve(Operand::Heap(d)));
                    write_slots(out, &[data, Value::Int(*length as i16)]);
                }
                HeapItem::FixedArray(slots) | HeapItem::Closure(slots) => {
                    let slots: Vec<Value> = slots.iter().map(|&s| layout.resolve(s)).collect();
                    write_slots(out, &slots);
                }
                HeapItem::String(bytes) | HeapItem::Uint8Array(bytes) => out.copy_from_slice(bytes),
                HeapItem::Int32(i) => out.copy_from_slice(&i.to_le_bytes()),
                HeapItem::Float64(n) => out.copy_from_slice(&n.to_le_bytes()),
            }
        }

        seal(&mut image);
        log::debug!(
            "built image: {} bytes, {} ROM items, {} globals, {} heap items",
            image.len(),
            self.rom.len(),
            self.globals.len(),
            self.heap.len()
        );
        image
    }
}

fn write_slots(out: &mut [u8], slots: &[Value]) {
    for (i, slot) in slots.iter().enumerate() {
        out[2 * i..2 * i + 2].copy_from_slice(&slot.encode().to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::format::{ImageHeader, read_u16};

    #[test]
    fn empty_builder_produces_valid_image() {
        let image = ImageBuilder::new().build();
        let header = ImageHeader::parse(&image).unwrap();
        assert_eq!(header.section_range(Section::Builtins).len(), 2 * BUILTIN_COUNT);
        // The intern list handle is the only global.
        assert_eq!(header.section_range(Section::Globals).len(), 2);
    }

    #[test]
    fn rom_bodies_are_four_byte_aligned() {
        let mut b = ImageBuilder::new();
        let a = b.string("abc");
        let c = b.string("zz");
        let n = b.number(1.5);
        b.export(1, a);
        b.export(2, c);
        b.export(3, n);
        let image = b.build();
        let header = ImageHeader::parse(&image).unwrap();
        let exports = header.section_range(Section::Export);
        for i in 0..3 {
            let value = Value::decode(read_u16(&image, exports.start + 4 * i + 2));
            let Value::Rom(RomPtr(offset)) = value else {
                panic!("export should be a ROM pointer");
            };
            assert_eq!(offset % 4, 0);
        }
    }

    #[test]
    fn string_table_is_sorted_and_deduplicated() {
        let mut b = ImageBuilder::new();
        let z = b.string("zebra");
        b.string("apple");
        assert_eq!(b.string("zebra"), z);
        assert_eq!(b.string("length"), Operand::Value(Value::StrLength));
        let image = b.build();
        let header = ImageHeader::parse(&image).unwrap();
        let table = header.section_range(Section::StringTable);
        assert_eq!(table.len(), 4);
        let first = read_u16(&image, table.start) as usize;
        let second = read_u16(&image, table.start + 2) as usize;
        assert_eq!(&image[first..first + 5], b"apple");
        assert_eq!(&image[second..second + 5], b"zebra");
    }

    #[test]
    fn heap_exports_go_through_handles() {
        let mut b = ImageBuilder::new();
        let obj = b.heap_object(Operand::Value(Value::Null), &[]);
        b.export(7, obj);
        let image = b.build();
        let header = ImageHeader::parse(&image).unwrap();
        let exports = header.section_range(Section::Export);
        let value = Value::decode(read_u16(&image, exports.start + 2));
        let Value::Rom(RomPtr(offset)) = value else {
            panic!("heap export should be a handle");
        };
        assert!(header.section_range(Section::Globals).contains(&(offset as usize)));
    }

    #[test]
    fn numbers_choose_smallest_representation() {
        let mut b = ImageBuilder::new();
        assert_eq!(b.number(12.0), Operand::Value(Value::Int(12)));
        assert_eq!(b.number(-0.0), Operand::Value(Value::NegZero));
        assert_eq!(b.number(f64::NAN), Operand::Value(Value::NaN));
        assert!(matches!(b.number(100_000.0), Operand::Rom(_)));
    }
}
