//! Tree file nodes
//!
//! ## Node Format
//!
//! ```text
//! token         u32   token whose path contains this node's label
//! label_length  u8    length of the label
//! num_children  u8    number of children
//! keys          [u8; num_children]   first byte of each child label
//! slots         [u32; num_children]  child references
//! ```
//!
//! A slot with the top bit set holds a leaf token: the child has no children
//! of its own and its label is the rest of that token's path, so no node is
//! written for it. Otherwise the slot is the offset of the child node.
//!
//! Labels are never stored. A node's label starts at the sum of its
//! ancestors' label lengths within the path of its token.

use crate::artifacts::file_index::FileToken;
use crate::errors::Corruption;
use byteorder::{ByteOrder, NetworkEndian};
use bytes::BufMut;
use derive_new::new;

/// Size of the fixed node header
pub const NODE_HEADER_SIZE: usize = 6;

/// Size of one child: a key byte plus a 4-byte slot
pub const CHILD_SIZE: usize = 5;

/// Marks a child slot that holds a leaf token
pub const LEAF_TAG: u32 = 1 << 31;

/// Labels are capped by the single-byte length field
pub const MAX_LABEL_LENGTH: usize = u8::MAX as usize;

/// Child count is capped by the single-byte count field
pub const MAX_CHILDREN: usize = u8::MAX as usize;

/// Tree file contents for an index holding no paths: a bare root
pub const EMPTY_TREE_BYTES: [u8; NODE_HEADER_SIZE] = [0; NODE_HEADER_SIZE];

/// Target of a child slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRef {
    /// Offset of an internal node in the tree file
    Node(u32),
    /// A childless node, fully described by its token
    Leaf(FileToken),
}

impl ChildRef {
    pub fn from_slot(slot: u32) -> Self {
        if slot & LEAF_TAG != 0 {
            ChildRef::Leaf(FileToken(slot & !LEAF_TAG))
        } else {
            ChildRef::Node(slot)
        }
    }

    pub fn to_slot(self) -> u32 {
        match self {
            ChildRef::Node(pointer) => pointer,
            ChildRef::Leaf(token) => token.0 | LEAF_TAG,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct TreeNodeHeader {
    pub token: FileToken,
    pub label_length: u8,
    pub num_children: u8,
}

impl TreeNodeHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, Corruption> {
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(Corruption::TreeFileEof);
        }

        Ok(TreeNodeHeader {
            token: FileToken(NetworkEndian::read_u32(&bytes[0..4])),
            label_length: bytes[4],
            num_children: bytes[5],
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.put_u32(self.token.0);
        out.put_u8(self.label_length);
        out.put_u8(self.num_children);
    }
}

/// A node parsed in place from the tree file
#[derive(Debug, Clone, Copy)]
pub struct TreeNode<'a> {
    pub token: FileToken,
    pub label_length: u8,
    keys: &'a [u8],
    slots: &'a [u8],
}

impl<'a> TreeNode<'a> {
    /// Root of a tree that holds no paths
    pub fn empty_root() -> TreeNode<'static> {
        TreeNode {
            token: FileToken::ROOT,
            label_length: 0,
            keys: &[],
            slots: &[],
        }
    }

    pub fn parse(tree: &'a [u8], pointer: u32) -> Result<Self, Corruption> {
        let bytes = tree
            .get(pointer as usize..)
            .ok_or(Corruption::TreeFileOutOfBounds)?;
        let header = TreeNodeHeader::parse(bytes)?;

        let num_children = header.num_children as usize;
        let keys_end = NODE_HEADER_SIZE + num_children;
        let slots_end = keys_end + 4 * num_children;
        if bytes.len() < slots_end {
            return Err(Corruption::TreeFileEof);
        }

        Ok(TreeNode {
            token: header.token,
            label_length: header.label_length,
            keys: &bytes[NODE_HEADER_SIZE..keys_end],
            slots: &bytes[keys_end..slots_end],
        })
    }

    pub fn num_children(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> &'a [u8] {
        self.keys
    }

    pub fn child_at(&self, index: usize) -> ChildRef {
        ChildRef::from_slot(NetworkEndian::read_u32(&self.slots[4 * index..4 * index + 4]))
    }

    pub fn children(&self) -> impl Iterator<Item = (u8, ChildRef)> + '_ {
        self.keys
            .iter()
            .enumerate()
            .map(|(index, &key)| (key, self.child_at(index)))
    }

    /// Child whose label starts with `key`
    pub fn find_child(&self, key: u8) -> Option<ChildRef> {
        let index = self.keys.iter().position(|&k| k == key)?;
        Some(self.child_at(index))
    }

    /// Bytes this node occupies in the tree file
    pub fn on_disk_size(&self) -> usize {
        node_size(self.num_children())
    }
}

/// On-disk size of a node with `num_children` children
pub fn node_size(num_children: usize) -> usize {
    NODE_HEADER_SIZE + CHILD_SIZE * num_children
}
