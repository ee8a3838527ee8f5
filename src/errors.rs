//! File index errors
//!
//! Three classes of failure are kept apart so callers can react to each one:
//!
//! - [`FileIndexError::Corrupted`]: bytes on disk do not form a valid file index
//! - [`FileIndexError::Programming`]: the API was driven in an invalid sequence
//! - [`FileIndexError::PathNotFound`] / [`FileIndexError::InvalidPath`]: the
//!   requested path cannot be used
//!
//! I/O failures carry the offending path.

use std::path::{Path, PathBuf};

/// A specific defect found while parsing on-disk data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Corruption {
    #[error("unrecognized format marker in docket")]
    BadFormatMarker,
    #[error("unexpected EOF while reading docket file")]
    DocketFileEof,
    #[error("garbage entry path is out of bounds or not UTF-8")]
    BadGarbagePath,
    #[error("file is smaller than its 'used size' docket field")]
    DataFileTooSmall,
    #[error("meta file 'used size' is not a multiple of the record size")]
    BadMetaFileSize,
    #[error("meta file does not start with the root sentinel record")]
    BadSentinel,
    #[error("metadata record has an empty path or a dirname longer than its path")]
    BadMetadata,
    #[error("root node of the tree is invalid")]
    BadRootNode,
    #[error("list file access out of bounds")]
    ListFileOutOfBounds,
    #[error("tree file access out of bounds")]
    TreeFileOutOfBounds,
    #[error("unexpected EOF while parsing tree file")]
    TreeFileEof,
    #[error("tree references a token missing from the meta file")]
    TokenOutOfRange,
    #[error("tree node label is empty or extends past its path")]
    BadLabel,
}

#[derive(Debug, thiserror::Error)]
pub enum FileIndexError {
    #[error("corrupted file index: {0}")]
    Corrupted(#[from] Corruption),

    #[error("programming error: {0}")]
    Programming(String),

    #[error("path not in file index: {}", String::from_utf8_lossy(.0))]
    PathNotFound(Vec<u8>),

    #[error("invalid path {:?}: {reason}", String::from_utf8_lossy(.path))]
    InvalidPath { path: Vec<u8>, reason: &'static str },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, FileIndexError>;

impl FileIndexError {
    pub(crate) fn programming(message: impl Into<String>) -> Self {
        FileIndexError::Programming(message.into())
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, FileIndexError::Corrupted(_))
    }

    pub fn is_programming(&self) -> bool {
        matches!(self, FileIndexError::Programming(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FileIndexError::PathNotFound(_) | FileIndexError::InvalidPath { .. }
        )
    }
}

/// Attaches the file path to a raw I/O error
pub(crate) trait IoResultExt<T> {
    fn with_path(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: &Path) -> Result<T> {
        self.map_err(|source| FileIndexError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
