pub mod bytecode;
mod error;
mod gc;
mod handles;
mod header;
mod heap;
pub mod image;
mod interning;
mod interpreter;
mod jobs;
mod objects;
mod operators;
mod stack;
mod value;
mod vm;

pub use bytecode::builder::{FunctionBuilder, Label};
pub use bytecode::decoder::BytecodeDecoder;
pub use bytecode::instruction::Instruction;
pub use bytecode::op::{BitOp, NumOp};
pub use error::{Error, HostFunctionId};
pub use gc::RootProvider;
pub use handles::Handle;
pub use header::Header;
pub use heap::{HeapSettings, MAX_HEAP_LIMIT};
pub use image::builder::{ImageBuilder, Operand, ShortCallTarget};
pub use image::format::{Builtin, ImageHeader, RomItems, Section};
pub use value::{HeapPtr, RomPtr, TypeCode, Value};
pub use vm::{
    AsyncCompletion, BreakpointCallback, HostFunction, MemoryStats, ValueType, Vm, VmCreateInfo,
};
