//! Data structures and codecs
//!
//! - `core`: configuration and the injectable clock
//! - `file_index`: on-disk format of the file index and its in-memory views

pub mod core;
pub mod file_index;
