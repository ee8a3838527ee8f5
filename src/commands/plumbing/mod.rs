//! Plumbing commands
//!
//! - `debug-file-index`: dump the docket or tree, look up single paths or
//!   tokens, and run a vacuum or a forced garbage collection

pub mod debug_file_index;
