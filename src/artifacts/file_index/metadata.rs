//! Meta file records

use crate::errors::Corruption;
use byteorder::{ByteOrder, NetworkEndian};
use bytes::BufMut;
use derive_new::new;

/// Size of one record in the meta file
pub const METADATA_SIZE: usize = 8;

/// Location of a token's path in the list file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, new)]
pub struct Metadata {
    /// Start of the path in the list file
    pub offset: u32,
    /// Length of the path
    pub length: u16,
    /// Length of the prefix up to and including the last slash, or 0
    pub dirname_length: u16,
}

impl Metadata {
    /// Record stored for the root token at the start of every meta file
    pub const SENTINEL: Metadata = Metadata {
        offset: 0,
        length: 0,
        dirname_length: 0,
    };

    /// Record for a validated `path` written at `offset` in the list file
    pub fn for_path(path: &[u8], offset: u32) -> Self {
        let dirname_length = path
            .iter()
            .rposition(|&c| c == b'/')
            .map_or(0, |slash| slash + 1);

        Metadata {
            offset,
            length: path.len() as u16,
            dirname_length: dirname_length as u16,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, Corruption> {
        if bytes.len() < METADATA_SIZE {
            return Err(Corruption::BadMetaFileSize);
        }

        Ok(Metadata {
            offset: NetworkEndian::read_u32(&bytes[0..4]),
            length: NetworkEndian::read_u16(&bytes[4..6]),
            dirname_length: NetworkEndian::read_u16(&bytes[6..8]),
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.put_u32(self.offset);
        out.put_u16(self.length);
        out.put_u16(self.dirname_length);
    }
}

/// A token's path split at its last slash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathInfo<'a> {
    path: &'a [u8],
    dirname_length: usize,
}

impl<'a> PathInfo<'a> {
    pub(crate) fn new(path: &'a [u8], dirname_length: usize) -> Self {
        PathInfo {
            path,
            dirname_length,
        }
    }

    pub fn path(&self) -> &'a [u8] {
        self.path
    }

    /// Everything before the last slash, or None if there is no slash
    pub fn dirname(&self) -> Option<&'a [u8]> {
        match self.dirname_length {
            0 => None,
            n => Some(&self.path[..n - 1]),
        }
    }

    /// Everything after the last slash
    pub fn basename(&self) -> &'a [u8] {
        &self.path[self.dirname_length..]
    }
}
