use core::fmt;

use super::op::{BitOp, NumOp, SmallLiteral};
use crate::value::Value;

/// A decoded instruction. Narrow and wide encodings of the same operation
/// decode to the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    LoadSmallLiteral(SmallLiteral),
    LoadVar { index: u16 },
    LoadScoped { index: u16 },
    LoadArg { index: u16 },
    LoadGlobal { index: u16 },
    /// Raw encoded value.
    LoadLiteral { raw: u16 },
    StoreVar { index: u16 },
    StoreScoped { index: u16 },
    StoreArg { index: u16 },
    StoreGlobal { index: u16 },

    Call { argc: u8, void: bool },
    CallShort { index: u8 },
    CallHost { import: u8, argc: u8 },
    /// Argument count excludes `this`.
    New { argc: u8 },
    Return,
    Throw,

    Jump { offset: i16 },
    Branch { offset: i16 },
    StartTry { catch_offset: u16 },
    EndTry,

    Pop,
    PopN { count: u16 },

    ScopeNew { slots: u16 },
    ScopePop,
    ScopeClone,
    ClosureNew,

    ObjectNew,
    ObjectGet,
    ObjectSet,
    ObjectGetKey { raw_key: u16 },
    ObjectSetKey { raw_key: u16 },
    ObjectKeys,
    ArrayNew { capacity: u8 },
    ArrayGet { index: u16 },
    ArraySet { index: u16 },
    FixedArrayNew { length: u16 },
    Uint8ArrayNew,
    ClassCreate,

    NumOp(NumOp),
    BitOp(BitOp),
    Add,
    Equal,
    NotEqual,
    LogicalNot,
    TypeOf,
    TypeCodeOf,

    AsyncStart { slots: u16 },
    Await,
    AwaitCall { argc: u8 },
    AsyncResume,
    AsyncReturn,
    AsyncComplete,

    Nop,
}

impl Instruction {
    /// Stack effect as `(pops, pushes)`. `CallShort` depends on the
    /// short-call table and is reported by the builder separately.
    pub fn stack_effect(self) -> (usize, usize) {
        use Instruction::*;
        match self {
            LoadSmallLiteral(_) | LoadVar { .. } | LoadScoped { .. } | LoadArg { .. }
            | LoadGlobal { .. } | LoadLiteral { .. } => (0, 1),
            StoreVar { .. } | StoreScoped { .. } | StoreArg { .. } | StoreGlobal { .. } => (1, 0),
            Call { argc, void } => (argc as usize + 1, if void { 0 } else { 1 }),
            CallShort { .. } => (0, 0),
            CallHost { argc, .. } => (argc as usize, 1),
            New { argc } => (argc as usize + 1, 1),
            Return | Throw => (1, 0),
            Jump { .. } => (0, 0),
            Branch { .. } => (1, 0),
            StartTry { .. } => (0, 2),
            EndTry => (2, 0),
            Pop => (1, 0),
            PopN { count } => (count as usize, 0),
            ScopeNew { .. } | ScopePop | ScopeClone => (0, 0),
            ClosureNew => (1, 1),
            ObjectNew => (0, 1),
            ObjectGet => (2, 1),
            ObjectSet => (3, 0),
            ObjectGetKey { .. } => (1, 1),
            ObjectSetKey { .. } => (2, 0),
            ObjectKeys => (1, 1),
            ArrayNew { .. } => (0, 1),
            ArrayGet { .. } => (1, 1),
            ArraySet { .. } => (2, 0),
            FixedArrayNew { .. } => (0, 1),
            Uint8ArrayNew => (1, 1),
            ClassCreate => (2, 1),
            NumOp(op) if op.is_unary() => (1, 1),
            NumOp(_) => (2, 1),
            BitOp(op) if op.is_unary() => (1, 1),
            BitOp(_) => (2, 1),
            Add | Equal | NotEqual => (2, 1),
            LogicalNot | TypeOf | TypeCodeOf => (1, 1),
            AsyncStart { .. } => (0, 2),
            Await => (1, 0),
            AwaitCall { argc } => (argc as usize + 1, 1),
            AsyncResume => (0, 1),
            AsyncReturn => (1, 0),
            AsyncComplete => (3, 0),
            Nop => (0, 0),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadSmallLiteral(lit) => write!(f, "LoadSmallLiteral {lit:?}"),
            Self::LoadVar { index } => write!(f, "LoadVar {index}"),
            Self::LoadScoped { index } => write!(f, "LoadScoped {index}"),
            Self::LoadArg { index } => write!(f, "LoadArg {index}"),
            Self::LoadGlobal { index } => write!(f, "LoadGlobal {index}"),
            Self::LoadLiteral { raw } => write!(f, "LoadLiteral {}", Value::decode(*raw)),
            Self::StoreVar { index } => write!(f, "StoreVar {index}"),
            Self::StoreScoped { index } => write!(f, "StoreScoped {index}"),
            Self::StoreArg { index } => write!(f, "StoreArg {index}"),
            Self::StoreGlobal { index } => write!(f, "StoreGlobal {index}"),
            Self::Call { argc, void: false } => write!(f, "Call {argc}"),
            Self::Call { argc, void: true } => write!(f, "CallVoid {argc}"),
            Self::CallShort { index } => write!(f, "CallShort #{index}"),
            Self::CallHost { import, argc } => write!(f, "CallHost #{import} {argc}"),
            Self::New { argc } => write!(f, "New {argc}"),
            Self::Return => f.write_str("Return"),
            Self::Throw => f.write_str("Throw"),
            Self::Jump { offset } => write!(f, "Jump {offset:+}"),
            Self::Branch { offset } => write!(f, "Branch {offset:+}"),
            Self::StartTry { catch_offset } => write!(f, "StartTry @{catch_offset}"),
            Self::EndTry => f.write_str("EndTry"),
            Self::Pop => f.write_str("Pop"),
            Self::PopN { count } => write!(f, "PopN {count}"),
            Self::ScopeNew { slots } => write!(f, "ScopeNew {slots}"),
            Self::ScopePop => f.write_str("ScopePop"),
            Self::ScopeClone => f.write_str("ScopeClone"),
            Self::ClosureNew => f.write_str("ClosureNew"),
            Self::ObjectNew => f.write_str("ObjectNew"),
            Self::ObjectGet => f.write_str("ObjectGet"),
            Self::ObjectSet => f.write_str("ObjectSet"),
            Self::ObjectGetKey { raw_key } => write!(f, "ObjectGet {}", Value::decode(*raw_key)),
            Self::ObjectSetKey { raw_key } => write!(f, "ObjectSet {}", Value::decode(*raw_key)),
            Self::ObjectKeys => f.write_str("ObjectKeys"),
            Self::ArrayNew { capacity } => write!(f, "ArrayNew {capacity}"),
            Self::ArrayGet { index } => write!(f, "ArrayGet {index}"),
            Self::ArraySet { index } => write!(f, "ArraySet {index}"),
            Self::FixedArrayNew { length } => write!(f, "FixedArrayNew {length}"),
            Self::Uint8ArrayNew => f.write_str("Uint8ArrayNew"),
            Self::ClassCreate => f.write_str("ClassCreate"),
            Self::NumOp(op) => write!(f, "NumOp {op:?}"),
            Self::BitOp(op) => write!(f, "BitOp {op:?}"),
            Self::Add => f.write_str("Add"),
            Self::Equal => f.write_str("Equal"),
            Self::NotEqual => f.write_str("NotEqual"),
            Self::LogicalNot => f.write_str("LogicalNot"),
            Self::TypeOf => f.write_str("TypeOf"),
            Self::TypeCodeOf => f.write_str("TypeCodeOf"),
            Self::AsyncStart { slots } => write!(f, "AsyncStart {slots}"),
            Self::Await => f.write_str("Await"),
            Self::AwaitCall { argc } => write!(f, "AwaitCall {argc}"),
            Self::AsyncResume => f.write_str("AsyncResume"),
            Self::AsyncReturn => f.write_str("AsyncReturn"),
            Self::AsyncComplete => f.write_str("AsyncComplete"),
            Self::Nop => f.write_str("Nop"),
        }
    }
}
