use crate::value::Value;

/// Words of stack budget charged per saved frame.
pub const FRAME_WORDS: usize = 4;

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct CallFlags: u8 {
        /// The frame was entered from the host; returning hands the result
        /// back to the host instead of the caller's bytecode.
        const CALLED_FROM_HOST = 1 << 0;
        /// The caller discards the result.
        const VOID_CALL = 1 << 1;
    }
}

/// Execution context of the active bytecode frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Registers {
    /// Image offset of the next instruction.
    pub pc: usize,
    /// Image offset of the current function body.
    pub function: usize,
    /// Stack index of the first local variable.
    pub frame_base: usize,
    /// Stack index of `this` (the first argument).
    pub args_base: usize,
    /// Argument count including `this`.
    pub arg_count: usize,
    pub flags: CallFlags,
    /// Active scope.
    pub closure: Value,
    /// Stack index of the innermost catch record.
    pub catch_target: Option<usize>,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            pc: 0,
            function: 0,
            frame_base: 0,
            args_base: 0,
            arg_count: 0,
            flags: CallFlags::empty(),
            closure: Value::Undefined,
            catch_target: None,
        }
    }
}

/// Caller state saved by a call, restored by the matching return.
#[derive(Debug, Clone, Copy)]
pub struct FrameBoundary {
    pub saved: Registers,
}

/// Catch records are two stack slots: `[link, handler]`.
pub const CATCH_RECORD_SLOTS: usize = 2;

/// Handler offset marking the catch record pushed by `AsyncStart`.
pub const ASYNC_CATCH_MARKER: i16 = -1;

/// Encode the link from a catch record at `at` to the previous one.
pub fn catch_link(at: usize, previous: Option<usize>) -> Value {
    match previous {
        Some(previous) => Value::Int((at - previous) as i16),
        None => Value::Undefined,
    }
}

/// Decode a catch record link stored at `at`.
pub fn follow_catch_link(at: usize, link: Value) -> Option<usize> {
    match link {
        Value::Int(distance) if distance > 0 => at.checked_sub(distance as usize),
        _ => None,
    }
}
