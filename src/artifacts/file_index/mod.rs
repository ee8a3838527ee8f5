//! File index on-disk format
//!
//! The file index maps repository paths to small integer tokens. It lives in
//! four files inside the store:
//!
//! ```text
//! fileindex             docket: used sizes, file IDs, root pointer, garbage list
//! fileindex-list.{ID}   path bytes, each followed by a NUL
//! fileindex-meta.{ID}   8-byte (offset, length, dirname_length) record per token
//! fileindex-tree.{ID}   radix tree nodes for path -> token lookups
//! ```
//!
//! All integers are big-endian. Data files are only ever appended to or
//! replaced by a new file with a new ID, so readers holding an older docket
//! keep seeing consistent bytes.
//!
//! Token 0 is reserved for the root of the tree and never names a path; its
//! meta record is all zeros.

pub mod docket;
pub mod metadata;
pub mod mutable_tree;
pub mod tree_node;
pub mod view;

use crate::errors::{FileIndexError, Result};
use std::fmt;

/// An integer that represents a file path in the repository
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileToken(pub u32);

impl FileToken {
    /// Token of the tree root, never assigned to a path
    pub const ROOT: FileToken = FileToken(0);

    /// Tokens must leave the top bit free for tagging leaves in the tree file
    pub const MAX: FileToken = FileToken((1 << 31) - 1);

    pub fn is_root(self) -> bool {
        self == FileToken::ROOT
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FileToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checks that a path can be stored in the list and meta files
pub fn validate_path(path: &[u8]) -> Result<()> {
    let reason = if path.is_empty() {
        "path is empty"
    } else if path.contains(&0) {
        "path contains a NUL byte"
    } else if path.len() > u16::MAX as usize {
        "path is longer than 65535 bytes"
    } else {
        return Ok(());
    };

    Err(FileIndexError::InvalidPath {
        path: path.to_vec(),
        reason,
    })
}

pub(crate) fn common_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
