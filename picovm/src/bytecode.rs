pub mod builder;
pub mod decoder;
pub mod instruction;
pub mod op;
