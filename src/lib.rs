//! A file index for version-control repositories
//!
//! Maps repository paths to dense integer tokens and back, stored in
//! append-only data files with a small docket that names the current ones.

pub mod areas;
pub mod artifacts;
pub mod commands;
pub mod errors;
