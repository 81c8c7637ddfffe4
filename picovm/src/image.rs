//! Image format, construction, loading and snapshotting.

pub mod builder;
pub mod format;
mod loader;
mod snapshot;
