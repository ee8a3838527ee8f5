//! Read-only file index view
//!
//! A [`FileIndexView`] wraps the list, meta and tree files of one docket
//! generation. It only looks at the first `*_file_size` bytes of each file,
//! so writers may append to the files while a view is alive.
//!
//! Every offset read from disk is bounds-checked before it is used; a bad one
//! surfaces as a [`Corruption`].

use crate::artifacts::file_index::docket::Docket;
use crate::artifacts::file_index::metadata::{METADATA_SIZE, Metadata, PathInfo};
use crate::artifacts::file_index::tree_node::{ChildRef, TreeNode};
use crate::artifacts::file_index::FileToken;
use crate::errors::Corruption;
use std::fmt;
use std::sync::LazyLock;

/// Bytes of one data file, either mapped or read into memory
pub trait DataSource: Send + Sync {
    fn bytes(&self) -> &[u8];
}

impl DataSource for memmap2::Mmap {
    fn bytes(&self) -> &[u8] {
        self
    }
}

impl DataSource for bytes::Bytes {
    fn bytes(&self) -> &[u8] {
        self
    }
}

/// One data file and the number of bytes the docket says are in use
struct DataFile {
    source: Box<dyn DataSource>,
    used_size: usize,
}

impl DataFile {
    fn open(source: Box<dyn DataSource>, used_size: u32) -> Result<Self, Corruption> {
        let used_size = used_size as usize;
        if source.bytes().len() < used_size {
            return Err(Corruption::DataFileTooSmall);
        }

        Ok(DataFile { source, used_size })
    }

    fn empty() -> Self {
        DataFile {
            source: Box::new(bytes::Bytes::new()),
            used_size: 0,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.source.bytes()[..self.used_size]
    }
}

/// An internal node as listed by [`FileIndexView::debug_iter_tree_nodes`]:
/// its pointer, its token, and `(key, label, child)` for each child
pub type DebugTreeNode<'a> = (u32, FileToken, Vec<(u8, &'a [u8], ChildRef)>);

static EMPTY_VIEW: LazyLock<FileIndexView> = LazyLock::new(FileIndexView::empty);

/// Immutable snapshot of the on-disk file index
pub struct FileIndexView {
    /// NUL-terminated paths, in token order
    list_file: DataFile,
    /// One fixed-size record per token, starting with the sentinel
    meta_file: DataFile,
    /// Radix tree nodes, possibly with unused bytes from earlier appends
    tree_file: DataFile,
    /// Offset of the root node in `tree_file`
    tree_root_pointer: u32,
    /// Bytes of `tree_file` no longer reachable from the root
    tree_unused_bytes: u32,
}

impl fmt::Debug for FileIndexView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileIndexView")
            .field("list_file_size", &self.list_file.used_size)
            .field("meta_file_size", &self.meta_file.used_size)
            .field("tree_file_size", &self.tree_file.used_size)
            .field("tree_root_pointer", &self.tree_root_pointer)
            .field("tree_unused_bytes", &self.tree_unused_bytes)
            .finish()
    }
}

impl FileIndexView {
    /// View of an index with no paths
    pub fn empty() -> Self {
        FileIndexView {
            list_file: DataFile::empty(),
            meta_file: DataFile::empty(),
            tree_file: DataFile::empty(),
            tree_root_pointer: 0,
            tree_unused_bytes: 0,
        }
    }

    /// A shared empty view, used as the base when rebuilding from scratch
    pub fn empty_ref() -> &'static FileIndexView {
        &EMPTY_VIEW
    }

    /// Validates the data files against the docket
    ///
    /// # Arguments
    ///
    /// * `docket` - Used sizes and tree layout of this generation
    /// * `list_file`, `meta_file`, `tree_file` - Contents of the data files,
    ///   empty for files the docket never created
    pub fn open(
        docket: &Docket,
        list_file: Box<dyn DataSource>,
        meta_file: Box<dyn DataSource>,
        tree_file: Box<dyn DataSource>,
    ) -> Result<Self, Corruption> {
        let view = FileIndexView {
            list_file: DataFile::open(list_file, docket.list_file_size)?,
            meta_file: DataFile::open(meta_file, docket.meta_file_size)?,
            tree_file: DataFile::open(tree_file, docket.tree_file_size)?,
            tree_root_pointer: docket.tree_root_pointer,
            tree_unused_bytes: docket.tree_unused_bytes,
        };

        let meta = view.meta_file();
        if meta.len() % METADATA_SIZE != 0 {
            return Err(Corruption::BadMetaFileSize);
        }
        if !meta.is_empty() && Metadata::parse(meta)? != Metadata::SENTINEL {
            return Err(Corruption::BadSentinel);
        }

        let root = view.root()?;
        if !root.token.is_root() || root.label_length != 0 {
            return Err(Corruption::BadRootNode);
        }
        if root.num_children() == 0 && !view.is_empty() {
            return Err(Corruption::BadRootNode);
        }

        Ok(view)
    }

    pub fn list_file(&self) -> &[u8] {
        self.list_file.bytes()
    }

    pub fn meta_file(&self) -> &[u8] {
        self.meta_file.bytes()
    }

    pub fn tree_file(&self) -> &[u8] {
        self.tree_file.bytes()
    }

    pub fn tree_root_pointer(&self) -> u32 {
        self.tree_root_pointer
    }

    pub fn tree_unused_bytes(&self) -> u32 {
        self.tree_unused_bytes
    }

    /// Number of tokens including the root, which is also the next token to
    /// assign
    pub fn token_count(&self) -> u32 {
        ((self.meta_file.used_size / METADATA_SIZE) as u32).max(1)
    }

    /// Number of paths in the index
    pub fn len(&self) -> usize {
        self.token_count() as usize - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_token(&self, token: FileToken) -> bool {
        !token.is_root() && token.0 < self.token_count()
    }

    /// Metadata record of a real token, or None if the token isn't in the view
    pub fn metadata(&self, token: FileToken) -> Result<Option<Metadata>, Corruption> {
        if !self.has_token(token) {
            return Ok(None);
        }
        let start = token.index() * METADATA_SIZE;
        Metadata::parse(&self.meta_file()[start..start + METADATA_SIZE]).map(Some)
    }

    pub fn get_path_info(&self, token: FileToken) -> Result<Option<PathInfo<'_>>, Corruption> {
        let Some(metadata) = self.metadata(token)? else {
            return Ok(None);
        };
        if metadata.length == 0 || metadata.dirname_length > metadata.length {
            return Err(Corruption::BadMetadata);
        }

        let path = self.read_span(metadata.offset, metadata.length)?;
        Ok(Some(PathInfo::new(path, metadata.dirname_length as usize)))
    }

    pub fn get_path(&self, token: FileToken) -> Result<Option<&[u8]>, Corruption> {
        Ok(self.get_path_info(token)?.map(|info| info.path()))
    }

    fn read_span(&self, offset: u32, length: u16) -> Result<&[u8], Corruption> {
        let start = offset as usize;
        self.list_file()
            .get(start..start + length as usize)
            .ok_or(Corruption::ListFileOutOfBounds)
    }

    /// Path of a token referenced from the tree, which must exist
    fn tree_token_path(&self, token: FileToken) -> Result<&[u8], Corruption> {
        self.get_path(token)?.ok_or(Corruption::TokenOutOfRange)
    }

    pub fn read_node(&self, pointer: u32) -> Result<TreeNode<'_>, Corruption> {
        TreeNode::parse(self.tree_file(), pointer)
    }

    pub fn root(&self) -> Result<TreeNode<'_>, Corruption> {
        if self.tree_file().is_empty() {
            return Ok(TreeNode::empty_root());
        }
        self.read_node(self.tree_root_pointer)
    }

    /// Label of an internal node whose parent ends at `depth`
    pub fn node_label(&self, node: &TreeNode<'_>, depth: usize) -> Result<&[u8], Corruption> {
        if node.token.is_root() || node.label_length == 0 {
            return Err(Corruption::BadLabel);
        }
        self.tree_token_path(node.token)?
            .get(depth..depth + node.label_length as usize)
            .ok_or(Corruption::BadLabel)
    }

    /// Label of a leaf token whose parent ends at `depth`
    pub fn leaf_label(&self, token: FileToken, depth: usize) -> Result<&[u8], Corruption> {
        match self.tree_token_path(token)?.get(depth..) {
            Some(label) if !label.is_empty() => Ok(label),
            _ => Err(Corruption::BadLabel),
        }
    }

    /// Label of any child reference whose parent ends at `depth`
    pub fn child_label(&self, child: ChildRef, depth: usize) -> Result<&[u8], Corruption> {
        match child {
            ChildRef::Leaf(token) => self.leaf_label(token, depth),
            ChildRef::Node(pointer) => self.node_label(&self.read_node(pointer)?, depth),
        }
    }

    /// Looks up a token by path
    pub fn get_token(&self, path: &[u8]) -> Result<Option<FileToken>, Corruption> {
        if path.is_empty() {
            return Ok(None);
        }

        let mut node = self.root()?;
        let mut depth = 0;
        while depth < path.len() {
            let remainder = &path[depth..];
            let Some(child) = node.find_child(remainder[0]) else {
                return Ok(None);
            };

            match child {
                ChildRef::Leaf(token) => {
                    let label = self.leaf_label(token, depth)?;
                    return Ok((label == remainder).then_some(token));
                }
                ChildRef::Node(pointer) => {
                    let child = self.read_node(pointer)?;
                    let label = self.node_label(&child, depth)?;
                    if !remainder.starts_with(label) {
                        return Ok(None);
                    }
                    depth += label.len();
                    node = child;
                }
            }
        }

        // The node's token may belong to a longer path sharing this prefix
        if self.tree_token_path(node.token)?.len() == path.len() {
            Ok(Some(node.token))
        } else {
            Ok(None)
        }
    }

    /// All `(path, token)` pairs in token order
    pub fn items(&self) -> impl Iterator<Item = Result<(PathInfo<'_>, FileToken), Corruption>> {
        (1..self.token_count()).map(|token| {
            let token = FileToken(token);
            let info = self.get_path_info(token)?.ok_or(Corruption::TokenOutOfRange)?;
            Ok((info, token))
        })
    }

    /// Internal nodes of the tree, depth-first starting from the root
    pub fn debug_iter_tree_nodes(&self) -> DebugTreeNodeIter<'_> {
        let stack = if self.tree_file().is_empty() {
            vec![]
        } else {
            vec![(self.tree_root_pointer, 0)]
        };
        DebugTreeNodeIter { view: self, stack }
    }
}

/// Iterator returned by [`FileIndexView::debug_iter_tree_nodes`]
pub struct DebugTreeNodeIter<'a> {
    view: &'a FileIndexView,
    /// Node pointer and the depth at which its children start
    stack: Vec<(u32, usize)>,
}

impl<'a> DebugTreeNodeIter<'a> {
    fn visit(&mut self, pointer: u32, depth: usize) -> Result<DebugTreeNode<'a>, Corruption> {
        let view = self.view;
        let node = view.read_node(pointer)?;

        let mut children = Vec::with_capacity(node.num_children());
        let mut internal = Vec::new();
        for (key, child) in node.children() {
            let label = view.child_label(child, depth)?;
            if let ChildRef::Node(child_pointer) = child {
                internal.push((child_pointer, depth + label.len()));
            }
            children.push((key, label, child));
        }
        // Reversed so the first child is visited first
        self.stack.extend(internal.into_iter().rev());

        Ok((pointer, node.token, children))
    }
}

impl<'a> Iterator for DebugTreeNodeIter<'a> {
    type Item = Result<DebugTreeNode<'a>, Corruption>;

    fn next(&mut self) -> Option<Self::Item> {
        let (pointer, depth) = self.stack.pop()?;
        let result = self.visit(pointer, depth);
        if result.is_err() {
            self.stack.clear();
        }
        Some(result)
    }
}
