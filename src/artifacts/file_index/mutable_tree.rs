//! Copy-on-write radix tree builder
//!
//! A [`MutableTree`] overlays insertions on a [`FileIndexView`]. Nodes of the
//! base tree are copied into memory only when an insertion walks through
//! them; everything else stays a pointer into the existing tree file.
//!
//! Serializing in [`SerializeMode::Append`] produces only the new and copied
//! nodes, to be appended after the base tree. The nodes they replace become
//! unused bytes. [`SerializeMode::Vacuum`] re-lays out every reachable node
//! into a fresh tree file with no unused bytes.

use crate::artifacts::file_index::tree_node::{
    ChildRef, LEAF_TAG, MAX_CHILDREN, MAX_LABEL_LENGTH, TreeNode, TreeNodeHeader,
};
use crate::artifacts::file_index::view::FileIndexView;
use crate::artifacts::file_index::{FileToken, common_prefix_length};
use crate::errors::{FileIndexError, Result};
use bytes::BufMut;

/// Written in place of a child pointer until the child's offset is known
const UNSET_POINTER: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeMode {
    /// Append new and copied nodes after the base tree
    Append,
    /// Write a complete tree file with no unused bytes
    Vacuum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodePointer {
    /// Index into [`MutableTree::nodes`]
    InMemory(usize),
    /// Offset into the base tree file
    OnDisk(u32),
}

#[derive(Debug)]
struct MutableTreeChild {
    /// First byte of the child's label
    key: u8,
    pointer: NodePointer,
}

#[derive(Debug)]
struct MutableTreeNode<'a> {
    token: FileToken,
    label: &'a [u8],
    children: Vec<MutableTreeChild>,
}

impl MutableTreeNode<'_> {
    fn find_child(&self, key: u8) -> Option<usize> {
        self.children.iter().position(|child| child.key == key)
    }

    /// Childless nodes are written as a tagged token in their parent
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Result of [`MutableTree::serialize`], mirroring the docket's tree fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedTree {
    /// Bytes to append to the tree file, or the whole file when vacuuming
    pub bytes: Vec<u8>,
    pub tree_file_size: u32,
    pub tree_root_pointer: u32,
    pub tree_unused_bytes: u32,
}

/// Work item for the serializer, with the path offset at which the node's
/// label starts
enum Pending {
    Memory(usize, usize),
    Disk(u32, usize),
}

pub struct MutableTree<'a> {
    base: &'a FileIndexView,
    nodes: Vec<MutableTreeNode<'a>>,
    /// On-disk size of base nodes that were copied and will be superseded
    copied_bytes: usize,
    num_paths_added: u32,
}

impl<'a> MutableTree<'a> {
    /// Tree with no base, for building from scratch
    pub fn empty(estimated_paths: usize) -> Self {
        let mut nodes = Vec::with_capacity(2 * estimated_paths + 1);
        nodes.push(MutableTreeNode {
            token: FileToken::ROOT,
            label: &[],
            children: Vec::new(),
        });

        MutableTree {
            base: FileIndexView::empty_ref(),
            nodes,
            copied_bytes: 0,
            num_paths_added: 0,
        }
    }

    pub fn with_base(base: &'a FileIndexView, estimated_paths: usize) -> Result<Self> {
        let mut tree = MutableTree {
            base,
            nodes: Vec::with_capacity(2 * estimated_paths + 1),
            copied_bytes: 0,
            num_paths_added: 0,
        };
        tree.copy_node(base.root()?, &[], 0)?;
        if base.tree_file().is_empty() {
            tree.copied_bytes = 0;
        }

        Ok(tree)
    }

    /// Number of tokens, root included, once the insertions are written
    pub fn token_count(&self) -> u32 {
        self.base.token_count() + self.num_paths_added
    }

    fn copy_node_at(&mut self, pointer: u32, depth: usize) -> Result<usize> {
        let base = self.base;
        let node = base.read_node(pointer)?;
        let label = base.node_label(&node, depth)?;
        self.copy_node(node, label, depth + label.len())
    }

    /// Copies a base node whose label ends at `depth` into memory
    fn copy_node(&mut self, node: TreeNode<'a>, label: &'a [u8], depth: usize) -> Result<usize> {
        let base = self.base;
        self.copied_bytes += node.on_disk_size();

        let index = self.nodes.len();
        self.nodes.push(MutableTreeNode {
            token: node.token,
            label,
            children: Vec::with_capacity(node.num_children()),
        });

        for (key, child) in node.children() {
            let pointer = match child {
                ChildRef::Node(pointer) => NodePointer::OnDisk(pointer),
                ChildRef::Leaf(token) => {
                    self.nodes.push(MutableTreeNode {
                        token,
                        label: base.leaf_label(token, depth)?,
                        children: Vec::new(),
                    });
                    NodePointer::InMemory(self.nodes.len() - 1)
                }
            };
            self.nodes[index].children.push(MutableTreeChild { key, pointer });
        }

        Ok(index)
    }

    /// Inserts `path`, which must not already be in the tree
    pub fn insert(&mut self, path: &'a [u8], token: FileToken) -> Result<()> {
        if path.is_empty() {
            return Err(FileIndexError::programming("cannot insert an empty path"));
        }
        if token.is_root() || token > FileToken::MAX {
            return Err(FileIndexError::programming(format!(
                "token {token} cannot be stored in the tree"
            )));
        }

        let mut node_index = 0;
        let mut position = 0;
        while position < path.len() {
            let Some(child_position) = self.nodes[node_index].find_child(path[position]) else {
                break;
            };
            let child_index = match self.nodes[node_index].children[child_position].pointer {
                NodePointer::InMemory(index) => index,
                NodePointer::OnDisk(pointer) => {
                    let index = self.copy_node_at(pointer, position)?;
                    self.nodes[node_index].children[child_position].pointer =
                        NodePointer::InMemory(index);
                    index
                }
            };

            let label = self.nodes[child_index].label;
            let remainder = &path[position..];
            let common = common_prefix_length(remainder, label);
            if common < label.len() {
                // Split the child, keeping the common prefix in a new node
                self.nodes[child_index].label = &label[common..];
                self.nodes.push(MutableTreeNode {
                    token,
                    label: &remainder[..common],
                    children: vec![MutableTreeChild {
                        key: label[common],
                        pointer: NodePointer::InMemory(child_index),
                    }],
                });
                let intermediate = self.nodes.len() - 1;
                self.nodes[node_index].children[child_position].pointer =
                    NodePointer::InMemory(intermediate);
                node_index = intermediate;
                position += common;
                break;
            }

            node_index = child_index;
            position += label.len();
        }

        let mut remainder = &path[position..];
        while !remainder.is_empty() {
            let (label, rest) = remainder.split_at(remainder.len().min(MAX_LABEL_LENGTH));
            if self.nodes[node_index].children.len() >= MAX_CHILDREN {
                return Err(FileIndexError::programming("tree node has too many children"));
            }

            self.nodes.push(MutableTreeNode {
                token,
                label,
                children: Vec::new(),
            });
            let leaf = self.nodes.len() - 1;
            self.nodes[node_index].children.push(MutableTreeChild {
                key: label[0],
                pointer: NodePointer::InMemory(leaf),
            });
            node_index = leaf;
            remainder = rest;
        }

        self.nodes[node_index].token = token;
        self.num_paths_added += 1;
        Ok(())
    }

    /// Serializes the tree, or returns None if appending would write nothing
    ///
    /// A tree without a base always appends.
    pub fn serialize(&self, mode: SerializeMode) -> Result<Option<SerializedTree>> {
        let base_size = self.base.tree_file().len();
        let mode = if base_size == 0 {
            SerializeMode::Append
        } else {
            mode
        };
        if mode == SerializeMode::Append && self.num_paths_added == 0 {
            return Ok(None);
        }

        let start = match mode {
            SerializeMode::Append => base_size,
            SerializeMode::Vacuum => 0,
        };
        let mut bytes = Vec::new();
        let mut stack = vec![(Pending::Memory(0, 0), None)];
        while let Some((pending, fixup)) = stack.pop() {
            let pointer = node_pointer(start + bytes.len())?;
            if let Some(fixup) = fixup {
                bytes[fixup..fixup + 4].copy_from_slice(&pointer.to_be_bytes());
            }

            match pending {
                Pending::Memory(index, depth) => {
                    self.write_memory_node(index, depth, mode, &mut bytes, &mut stack)?
                }
                Pending::Disk(pointer, depth) => {
                    self.write_disk_node(pointer, depth, &mut bytes, &mut stack)?
                }
            }
        }

        let serialized = match mode {
            SerializeMode::Append => SerializedTree {
                tree_file_size: to_u32(base_size + bytes.len())?,
                tree_root_pointer: to_u32(base_size)?,
                tree_unused_bytes: to_u32(
                    self.base.tree_unused_bytes() as usize + self.copied_bytes,
                )?,
                bytes,
            },
            SerializeMode::Vacuum => SerializedTree {
                tree_file_size: to_u32(bytes.len())?,
                tree_root_pointer: 0,
                tree_unused_bytes: 0,
                bytes,
            },
        };

        Ok(Some(serialized))
    }

    fn write_memory_node(
        &self,
        index: usize,
        depth: usize,
        mode: SerializeMode,
        bytes: &mut Vec<u8>,
        stack: &mut Vec<(Pending, Option<usize>)>,
    ) -> Result<()> {
        let node = &self.nodes[index];
        let label_length = u8::try_from(node.label.len())
            .map_err(|_| FileIndexError::programming("tree node label is too long"))?;
        let child_depth = depth + node.label.len();
        TreeNodeHeader::new(node.token, label_length, node.children.len() as u8).write_to(bytes);
        bytes.extend(node.children.iter().map(|child| child.key));

        for child in &node.children {
            let slot = match child.pointer {
                NodePointer::InMemory(child_index) if self.nodes[child_index].is_leaf() => {
                    ChildRef::Leaf(self.nodes[child_index].token).to_slot()
                }
                NodePointer::InMemory(child_index) => {
                    stack.push((Pending::Memory(child_index, child_depth), Some(bytes.len())));
                    UNSET_POINTER
                }
                NodePointer::OnDisk(pointer) if mode == SerializeMode::Append => pointer,
                NodePointer::OnDisk(pointer) => {
                    stack.push((Pending::Disk(pointer, child_depth), Some(bytes.len())));
                    UNSET_POINTER
                }
            };
            bytes.put_u32(slot);
        }

        Ok(())
    }

    /// Re-emits an untouched base node, queueing its internal children
    ///
    /// The label is checked against the node's token path, so every level
    /// moves strictly deeper into a path and a cycle of pointers in a corrupt
    /// tree ends in an error.
    fn write_disk_node(
        &self,
        pointer: u32,
        depth: usize,
        bytes: &mut Vec<u8>,
        stack: &mut Vec<(Pending, Option<usize>)>,
    ) -> Result<()> {
        let node = self.base.read_node(pointer)?;
        let child_depth = depth + self.base.node_label(&node, depth)?.len();
        TreeNodeHeader::new(node.token, node.label_length, node.num_children() as u8)
            .write_to(bytes);
        bytes.extend_from_slice(node.keys());

        for (_, child) in node.children() {
            let slot = match child {
                ChildRef::Leaf(_) => child.to_slot(),
                ChildRef::Node(child_pointer) => {
                    stack.push((Pending::Disk(child_pointer, child_depth), Some(bytes.len())));
                    UNSET_POINTER
                }
            };
            bytes.put_u32(slot);
        }

        Ok(())
    }
}

/// Node offsets must leave the leaf tag bit clear
fn node_pointer(offset: usize) -> Result<u32> {
    match u32::try_from(offset) {
        Ok(pointer) if pointer < LEAF_TAG => Ok(pointer),
        _ => Err(FileIndexError::programming("tree file is too large")),
    }
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| FileIndexError::programming("tree file is too large"))
}
