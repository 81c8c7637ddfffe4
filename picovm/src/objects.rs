//! Object model on top of the 16-bit heap: property lists, arrays,
//! strings, classes and callables.
//!
//! Every operation here is an `impl Vm` block so it can reach both the
//! live heap and the read-only image. Objects in the image are readable
//! through the same accessors; writes to them fail with a type error.
mod arrays;
mod functions;
mod properties;
mod strings;

pub(crate) use functions::Callee;

use crate::value::{TypeCode, Value};
use crate::vm::{ObjRef, Vm};

impl Vm<'_> {
    /// Location of `value` if it is an allocation of type `expected`.
    pub(crate) fn object_of_type(&self, value: Value, expected: TypeCode) -> Option<ObjRef> {
        let obj = self.obj_ref(value)?;
        (self.header_of(obj).type_code() == expected).then_some(obj)
    }
}
