//! Command implementations.
//!
//! Each command group is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod image;
