//! Porcelain commands
//!
//! - `init`: create the `.fidx` directory and an empty store
//! - `add`: give paths a token
//! - `remove`: drop paths from the index, renumbering the remaining tokens

pub mod add;
pub mod init;
pub mod remove;
