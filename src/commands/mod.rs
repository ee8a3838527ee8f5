//! Command implementations
//!
//! Commands are `impl Repository` blocks, in two groups:
//!
//! - `plumbing`: inspection and maintenance of the file index internals
//! - `porcelain`: everyday operations (init, add, remove)

pub mod plumbing;
pub mod porcelain;
