//! File index docket
//!
//! The docket is the only file read to bootstrap the index and the only one
//! rewritten in place (atomically, by the transaction). It records which
//! generation of data files is current and how many bytes of each are in use.
//!
//! ## Format
//!
//! ```text
//! Header (76 bytes):
//!   marker "fileindex-v1"                  12
//!   list_file_size, reserved_revlog_size,
//!   meta_file_size, tree_file_size       4 x 4
//!   list_file_id, reserved_revlog_id,
//!   meta_file_id, tree_file_id           4 x 8
//!   tree_root_pointer, tree_unused_bytes,
//!   reserved_revlog_unused, reserved_flags 4 x 4
//!
//! Garbage list:
//!   num_entries, path_buf_size             4 x 2
//!   num_entries x (ttl:u16, timestamp:u32, path_offset:u32, path_length:u16)
//!   path_buf (each path followed by a NUL)
//! ```

use crate::errors::Corruption;
use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::BufMut;
use derive_new::new;
use std::fmt;
use std::io::Read;

/// Redundant sanity check at the start of the docket
pub const FORMAT_MARKER: &[u8; 12] = b"fileindex-v1";

/// Size of the fixed part of the docket
pub const DOCKET_HEADER_SIZE: usize = FORMAT_MARKER.len() + 4 * 4 + 4 * FileUid::SIZE + 4 * 4;

const GARBAGE_HEADER_SIZE: usize = 8;

const GARBAGE_INDEX_ENTRY_SIZE: usize = 12;

/// Name of the docket file in the store
pub const DOCKET_FILE: &str = "fileindex";

/// Name of the docket written for pre-commit hooks
pub const PENDING_DOCKET_FILE: &str = "fileindex.pending";

/// Identifier embedded in a data file name
///
/// Eight ASCII hex characters. All zeros means no file has been created yet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileUid([u8; FileUid::SIZE]);

impl FileUid {
    pub const SIZE: usize = 8;

    pub const UNSET: FileUid = FileUid([0; FileUid::SIZE]);

    pub fn random() -> Self {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let uuid = uuid::Uuid::new_v4();
        let mut id = [0u8; FileUid::SIZE];
        for (i, byte) in uuid.as_bytes()[..FileUid::SIZE / 2].iter().enumerate() {
            id[2 * i] = HEX[(byte >> 4) as usize];
            id[2 * i + 1] = HEX[(byte & 0x0f) as usize];
        }
        FileUid(id)
    }

    pub fn is_unset(&self) -> bool {
        *self == FileUid::UNSET
    }

    pub fn as_bytes(&self) -> &[u8; FileUid::SIZE] {
        &self.0
    }
}

impl fmt::Display for FileUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            return write!(f, "unset");
        }
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for FileUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileUid({self})")
    }
}

/// The three data files referenced by the docket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFileKind {
    List,
    Meta,
    Tree,
}

impl DataFileKind {
    pub const ALL: [DataFileKind; 3] = [DataFileKind::List, DataFileKind::Meta, DataFileKind::Tree];

    /// Name of data files of this kind, before the `.ID` suffix
    pub fn prefix(self) -> &'static str {
        match self {
            DataFileKind::List => "fileindex-list",
            DataFileKind::Meta => "fileindex-meta",
            DataFileKind::Tree => "fileindex-tree",
        }
    }
}

/// A former data file waiting to be deleted
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct GarbageEntry {
    /// Decremented by each transaction; the file is kept until it reaches zero
    pub ttl: u16,
    /// Seconds since the Unix epoch when the entry was added
    pub timestamp: u32,
    /// File name relative to the store
    pub path: String,
}

impl GarbageEntry {
    /// Whether the file can be deleted at `now` with the given retention window
    pub fn is_eligible(&self, now: u32, retention_s: u32) -> bool {
        if self.ttl > 0 {
            return false;
        }
        // Zero retention never depends on timing
        if retention_s == 0 {
            return true;
        }
        u64::from(now) > u64::from(self.timestamp) + u64::from(retention_s)
    }
}

/// Parsed contents of the docket file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Docket {
    /// Used size of the list file in bytes
    pub list_file_size: u32,
    /// Reserved for future use
    pub reserved_revlog_size: u32,
    /// Used size of the meta file in bytes
    pub meta_file_size: u32,
    /// Used size of the tree file in bytes
    pub tree_file_size: u32,
    pub list_file_id: FileUid,
    /// Reserved for future use
    pub reserved_revlog_id: FileUid,
    pub meta_file_id: FileUid,
    pub tree_file_id: FileUid,
    /// Offset of the root node in the tree file
    pub tree_root_pointer: u32,
    /// Bytes of the tree file no longer reachable from the root
    pub tree_unused_bytes: u32,
    /// Reserved for future use
    pub reserved_revlog_unused: u32,
    /// Currently unused, always zero after parsing and on disk
    pub reserved_flags: u32,
    pub garbage_entries: Vec<GarbageEntry>,
}

impl Docket {
    pub fn parse(bytes: &[u8]) -> Result<Self, Corruption> {
        if bytes.len() < DOCKET_HEADER_SIZE {
            return Err(Corruption::DocketFileEof);
        }

        let (header, rest) = bytes.split_at(DOCKET_HEADER_SIZE);
        let (marker, mut reader) = header.split_at(FORMAT_MARKER.len());
        if marker != FORMAT_MARKER {
            return Err(Corruption::BadFormatMarker);
        }

        let eof = |_| Corruption::DocketFileEof;
        let list_file_size = reader.read_u32::<NetworkEndian>().map_err(eof)?;
        let reserved_revlog_size = reader.read_u32::<NetworkEndian>().map_err(eof)?;
        let meta_file_size = reader.read_u32::<NetworkEndian>().map_err(eof)?;
        let tree_file_size = reader.read_u32::<NetworkEndian>().map_err(eof)?;
        let list_file_id = read_uid(&mut reader)?;
        let reserved_revlog_id = read_uid(&mut reader)?;
        let meta_file_id = read_uid(&mut reader)?;
        let tree_file_id = read_uid(&mut reader)?;
        let tree_root_pointer = reader.read_u32::<NetworkEndian>().map_err(eof)?;
        let tree_unused_bytes = reader.read_u32::<NetworkEndian>().map_err(eof)?;
        let reserved_revlog_unused = reader.read_u32::<NetworkEndian>().map_err(eof)?;
        // reserved_flags is read past and reset
        let _ = reader.read_u32::<NetworkEndian>().map_err(eof)?;

        Ok(Docket {
            list_file_size,
            reserved_revlog_size,
            meta_file_size,
            tree_file_size,
            list_file_id,
            reserved_revlog_id,
            meta_file_id,
            tree_file_id,
            tree_root_pointer,
            tree_unused_bytes,
            reserved_revlog_unused,
            reserved_flags: 0,
            garbage_entries: parse_garbage_list(rest)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DOCKET_HEADER_SIZE + GARBAGE_HEADER_SIZE);
        bytes.extend_from_slice(FORMAT_MARKER);
        for value in [
            self.list_file_size,
            self.reserved_revlog_size,
            self.meta_file_size,
            self.tree_file_size,
        ] {
            bytes.put_u32(value);
        }
        for id in [
            self.list_file_id,
            self.reserved_revlog_id,
            self.meta_file_id,
            self.tree_file_id,
        ] {
            bytes.extend_from_slice(id.as_bytes());
        }
        for value in [
            self.tree_root_pointer,
            self.tree_unused_bytes,
            self.reserved_revlog_unused,
        ] {
            bytes.put_u32(value);
        }
        bytes.put_u32(0);

        serialize_garbage_list(&self.garbage_entries, &mut bytes);
        bytes
    }

    pub fn file_id(&self, kind: DataFileKind) -> FileUid {
        match kind {
            DataFileKind::List => self.list_file_id,
            DataFileKind::Meta => self.meta_file_id,
            DataFileKind::Tree => self.tree_file_id,
        }
    }

    pub fn file_size(&self, kind: DataFileKind) -> u32 {
        match kind {
            DataFileKind::List => self.list_file_size,
            DataFileKind::Meta => self.meta_file_size,
            DataFileKind::Tree => self.tree_file_size,
        }
    }

    /// Point `kind` at a new file generation
    pub fn set_file(&mut self, kind: DataFileKind, id: FileUid, size: u32) {
        let (id_field, size_field) = match kind {
            DataFileKind::List => (&mut self.list_file_id, &mut self.list_file_size),
            DataFileKind::Meta => (&mut self.meta_file_id, &mut self.meta_file_size),
            DataFileKind::Tree => (&mut self.tree_file_id, &mut self.tree_file_size),
        };
        *id_field = id;
        *size_field = size;
    }

    /// Store-relative name of a data file, or None if it was never created
    pub fn data_file_path(&self, kind: DataFileKind) -> Option<String> {
        let id = self.file_id(kind);
        if id.is_unset() {
            return None;
        }
        Some(format!("{}.{}", kind.prefix(), id))
    }
}

fn read_uid(reader: &mut &[u8]) -> Result<FileUid, Corruption> {
    let mut id = [0u8; FileUid::SIZE];
    reader
        .read_exact(&mut id)
        .map_err(|_| Corruption::DocketFileEof)?;
    Ok(FileUid(id))
}

fn parse_garbage_list(bytes: &[u8]) -> Result<Vec<GarbageEntry>, Corruption> {
    let eof = |_| Corruption::DocketFileEof;
    let mut reader = bytes;
    let num_entries = reader.read_u32::<NetworkEndian>().map_err(eof)? as usize;
    let path_buf_size = reader.read_u32::<NetworkEndian>().map_err(eof)? as usize;

    let index_size = num_entries
        .checked_mul(GARBAGE_INDEX_ENTRY_SIZE)
        .ok_or(Corruption::DocketFileEof)?;
    if reader.len() < index_size {
        return Err(Corruption::DocketFileEof);
    }
    let (mut index, rest) = reader.split_at(index_size);
    let path_buf = rest
        .get(..path_buf_size)
        .ok_or(Corruption::DocketFileEof)?;

    let mut entries = Vec::with_capacity(num_entries);
    for _ in 0..num_entries {
        let ttl = index.read_u16::<NetworkEndian>().map_err(eof)?;
        let timestamp = index.read_u32::<NetworkEndian>().map_err(eof)?;
        let path_offset = index.read_u32::<NetworkEndian>().map_err(eof)? as usize;
        let path_length = index.read_u16::<NetworkEndian>().map_err(eof)? as usize;

        let path = path_buf
            .get(path_offset..path_offset + path_length)
            .ok_or(Corruption::BadGarbagePath)?;
        let path = std::str::from_utf8(path).map_err(|_| Corruption::BadGarbagePath)?;

        entries.push(GarbageEntry::new(ttl, timestamp, path.to_string()));
    }

    Ok(entries)
}

fn serialize_garbage_list(entries: &[GarbageEntry], bytes: &mut Vec<u8>) {
    let path_buf_size: usize = entries.iter().map(|entry| entry.path.len() + 1).sum();
    bytes.put_u32(entries.len() as u32);
    bytes.put_u32(path_buf_size as u32);

    let mut offset = 0u32;
    for entry in entries {
        bytes.put_u16(entry.ttl);
        bytes.put_u32(entry.timestamp);
        bytes.put_u32(offset);
        bytes.put_u16(entry.path.len() as u16);
        offset += entry.path.len() as u32 + 1;
    }

    for entry in entries {
        bytes.extend_from_slice(entry.path.as_bytes());
        bytes.push(0);
    }
}
