use std::fmt;

use crate::value::Value;

/// Host function identifier, as listed in the image import table.
pub type HostFunctionId = u16;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Image structure is inconsistent.
    InvalidBytecode(&'static str),
    BytecodeSizeMismatch { expected: usize, actual: usize },
    CrcMismatch { expected: u16, actual: u16 },
    VersionMismatch { found: u8, supported: u8 },
    FeatureMismatch { required: u32, supported: u32 },
    UnresolvedImport(HostFunctionId),
    UnresolvedExport(u16),
    /// `VmCreateInfo` was rejected before loading.
    InvalidSettings(&'static str),
    /// A snapshot would not fit the 16-bit image address space.
    ImageTooLarge(usize),

    OutOfMemory,
    AllocationTooLarge(usize),

    TypeError(&'static str),
    RangeError(&'static str),

    /// Uncaught script exception.
    Exception(Value),
    StackOverflow,
    InstructionCountReached,

    /// `async_start` called outside a host function.
    NotInHostCall,
    /// The operation needs an idle VM (no call in progress).
    VmBusy,
    InvalidHandle,

    /// Internal inconsistency in the heap or in executing bytecode.
    Corrupt(&'static str),
    /// The VM hit a fatal error earlier and can no longer be used.
    Dead,
}

impl Error {
    /// Fatal errors leave the VM unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::OutOfMemory | Error::Corrupt(_) | Error::Dead)
    }

    /// Errors a running script can observe with `try`/`catch`.
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            Error::Exception(_)
                | Error::TypeError(_)
                | Error::RangeError(_)
                | Error::AllocationTooLarge(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidBytecode(msg) => write!(f, "invalid bytecode: {msg}"),
            Error::BytecodeSizeMismatch { expected, actual } => {
                write!(f, "bytecode size mismatch: header says {expected}, got {actual}")
            }
            Error::CrcMismatch { expected, actual } => {
                write!(f, "bytecode CRC mismatch: expected {expected:#06x}, computed {actual:#06x}")
            }
            Error::VersionMismatch { found, supported } => {
                write!(f, "bytecode version {found} not supported (engine supports {supported})")
            }
            Error::FeatureMismatch { required, supported } => write!(
                f,
                "image requires features {required:#x}, engine supports {supported:#x}"
            ),
            Error::UnresolvedImport(id) => write!(f, "unresolved import {id}"),
            Error::UnresolvedExport(id) => write!(f, "unresolved export {id}"),
            Error::InvalidSettings(msg) => write!(f, "invalid VM settings: {msg}"),
            Error::ImageTooLarge(size) => write!(f, "image of {size} bytes exceeds 64 KiB"),
            Error::OutOfMemory => f.write_str("out of memory"),
            Error::AllocationTooLarge(size) => write!(f, "RangeError: allocation of {size} bytes too large"),
            Error::TypeError(msg) => write!(f, "TypeError: {msg}"),
            Error::RangeError(msg) => write!(f, "RangeError: {msg}"),
            Error::Exception(value) => write!(f, "uncaught exception: {value}"),
            Error::StackOverflow => f.write_str("stack overflow"),
            Error::InstructionCountReached => f.write_str("instruction count reached"),
            Error::NotInHostCall => f.write_str("not inside a host function call"),
            Error::VmBusy => f.write_str("operation requires an idle VM"),
            Error::InvalidHandle => f.write_str("invalid handle"),
            Error::Corrupt(msg) => write!(f, "internal error: {msg}"),
            Error::Dead => f.write_str("VM is unusable after a fatal error"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::OutOfMemory.is_fatal());
        assert!(!Error::OutOfMemory.is_catchable());
        assert!(Error::TypeError("x").is_catchable());
        assert!(!Error::StackOverflow.is_catchable());
        assert!(!Error::StackOverflow.is_fatal());
        assert!(Error::Exception(Value::Int(1)).is_catchable());
    }

    #[test]
    fn type_error_message_is_js_like() {
        assert_eq!(
            Error::TypeError("not a function").to_string(),
            "TypeError: not a function"
        );
    }
}
