//! File index
//!
//! Maps repository paths to small integer tokens. See
//! [`crate::artifacts::file_index`] for the on-disk format.
//!
//! ## Writes
//!
//! `add`, `remove`, `vacuum` and `garbage_collect` only stage changes and
//! register the index as a [`FileGenerator`] with the transaction. At commit:
//!
//! - adding appends to the list and meta files and appends new tree nodes,
//!   unless the tree has too many unused bytes, in which case the tree file
//!   is rewritten (vacuumed)
//! - removing rewrites all three files with tokens renumbered from 1
//! - files that are replaced are put on the docket's garbage list and deleted
//!   by a later `garbage_collect`
//!
//! A single transaction may add or remove paths, but not both.
//!
//! The in-memory docket and view only move forward in
//! [`FileGenerator::committed`], once the new docket is on disk. If the
//! transaction fails or is aborted, the staged changes are discarded and the
//! index keeps describing the last published state.

use crate::areas::store::Store;
use crate::areas::transaction::{FileGenerator, Transaction};
use crate::artifacts::core::clock::Clock;
use crate::artifacts::core::config::{Config, LoadMode, VacuumMode};
use crate::artifacts::file_index::docket::{
    DOCKET_FILE, DataFileKind, Docket, FileUid, GarbageEntry, PENDING_DOCKET_FILE,
};
use crate::artifacts::file_index::metadata::Metadata;
use crate::artifacts::file_index::mutable_tree::{MutableTree, SerializeMode, SerializedTree};
use crate::artifacts::file_index::tree_node::EMPTY_TREE_BYTES;
use crate::artifacts::file_index::view::{DataSource, DebugTreeNodeIter, FileIndexView};
use crate::artifacts::file_index::{FileToken, validate_path};
use crate::errors::{FileIndexError, IoResultExt, Result};
use indexmap::IndexSet;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;

/// Id under which the index registers itself with transactions
pub const GENERATOR_ID: &str = "fileindex";

/// Tree files smaller than this are never vacuumed automatically
pub const AUTO_VACUUM_MIN_SIZE: u32 = 16 * 1024;

/// Transactions a replaced data file survives before it can be deleted
pub const INITIAL_GARBAGE_TTL: u16 = 2;

/// Docket and view written by `generate`, installed once the transaction
/// commits
struct Prepared {
    docket: Docket,
    view: Arc<FileIndexView>,
}

pub struct FileIndex {
    /// Store holding the docket and the data files
    store: Store,
    /// Vacuum, garbage collection and load settings
    config: Config,
    /// Source of garbage timestamps and of "now" for collection
    clock: Box<dyn Clock>,
    /// Last published docket
    docket: Docket,
    /// Data files described by `docket`
    view: Arc<FileIndexView>,
    /// Paths staged for addition; the token of `add_paths[i]` is
    /// `view.token_count() + i`
    add_paths: IndexSet<Vec<u8>>,
    /// Tokens staged for removal
    remove_tokens: HashSet<FileToken>,
    /// Rewrite the tree file at the next commit
    force_vacuum: bool,
    /// Garbage list left by `garbage_collect`, replacing the docket's at commit
    staged_garbage: Option<Vec<GarbageEntry>>,
    /// Result of the last `generate`, waiting for the transaction's outcome
    prepared: Option<Prepared>,
}

impl FileIndex {
    /// Opens the index in `store`
    ///
    /// # Arguments
    ///
    /// * `store` - Store holding the docket and data files
    /// * `try_pending` - Prefer the docket written by
    ///   [`StoreTransaction::write_pending`](crate::areas::transaction::StoreTransaction::write_pending)
    ///   for a transaction that is still open
    /// * `config` - Vacuum, garbage collection and load settings
    /// * `clock` - Time source for garbage entries
    pub fn open(
        store: Store,
        try_pending: bool,
        config: Config,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let docket = read_docket(&store, try_pending)?;
        let view = load_view(&store, &docket, config.load_mode)?;
        tracing::debug!(
            store = %store.root().display(),
            paths = view.len(),
            tree_file_size = docket.tree_file_size,
            "opened file index"
        );

        Ok(FileIndex {
            store,
            config,
            clock,
            docket,
            view: Arc::new(view),
            add_paths: IndexSet::new(),
            remove_tokens: HashSet::new(),
            force_vacuum: false,
            staged_garbage: None,
            prepared: None,
        })
    }

    pub fn docket(&self) -> &Docket {
        &self.docket
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The committed state, for lock-free readers
    pub fn snapshot(&self) -> Arc<FileIndexView> {
        Arc::clone(&self.view)
    }

    /// Tokens in use, root and staged additions included
    fn token_count(&self) -> u32 {
        self.view.token_count() + self.add_paths.len() as u32
    }

    pub fn len(&self) -> usize {
        self.token_count() as usize - 1 - self.remove_tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_token(&self, token: FileToken) -> bool {
        !token.is_root() && token.0 < self.token_count() && !self.remove_tokens.contains(&token)
    }

    pub fn has_path(&self, path: &[u8]) -> Result<bool> {
        Ok(self.get_token(path)?.is_some())
    }

    pub fn get_path(&self, token: FileToken) -> Result<Option<&[u8]>> {
        if !self.has_token(token) {
            return Ok(None);
        }

        let on_disk = self.view.token_count();
        if token.0 < on_disk {
            return Ok(self.view.get_path(token)?);
        }
        Ok(self
            .add_paths
            .get_index((token.0 - on_disk) as usize)
            .map(Vec::as_slice))
    }

    pub fn get_token(&self, path: &[u8]) -> Result<Option<FileToken>> {
        if let Some(index) = self.add_paths.get_index_of(path) {
            return Ok(Some(FileToken(self.view.token_count() + index as u32)));
        }

        let token = self.view.get_token(path)?;
        Ok(token.filter(|token| !self.remove_tokens.contains(token)))
    }

    /// `(path, token)` pairs in token order, staged changes included
    pub fn iter(&self) -> impl Iterator<Item = Result<(&[u8], FileToken)>> {
        (1..self.token_count()).filter_map(|token| {
            let token = FileToken(token);
            self.get_path(token)
                .transpose()
                .map(|path| path.map(|path| (path, token)))
        })
    }

    /// Internal nodes of the committed tree
    pub fn debug_iter_tree_nodes(&self) -> DebugTreeNodeIter<'_> {
        self.view.debug_iter_tree_nodes()
    }

    /// Store-relative names of the docket and the current data files
    pub fn data_files(&self) -> Vec<String> {
        let mut files = vec![DOCKET_FILE.to_string()];
        files.extend(
            DataFileKind::ALL
                .iter()
                .filter_map(|&kind| self.docket.data_file_path(kind)),
        );
        files
    }

    /// Stages `path`, returning its token and whether it was new
    pub fn add(&mut self, path: &[u8], tr: &mut dyn Transaction) -> Result<(FileToken, bool)> {
        validate_path(path)?;
        if !self.remove_tokens.is_empty() {
            return Err(FileIndexError::programming(
                "cannot add and remove in the same transaction",
            ));
        }
        if let Some(token) = self.get_token(path)? {
            return Ok((token, false));
        }

        let token = FileToken(self.token_count());
        if token > FileToken::MAX {
            return Err(FileIndexError::programming("file index is out of tokens"));
        }
        self.add_paths.insert(path.to_vec());
        self.register(tr);
        Ok((token, true))
    }

    /// Stages the removal of `path`, returning the token it had
    pub fn remove(&mut self, path: &[u8], tr: &mut dyn Transaction) -> Result<FileToken> {
        if !self.add_paths.is_empty() {
            return Err(FileIndexError::programming(
                "cannot add and remove in the same transaction",
            ));
        }
        let token = self
            .get_token(path)?
            .ok_or_else(|| FileIndexError::PathNotFound(path.to_vec()))?;

        self.remove_tokens.insert(token);
        self.register(tr);
        Ok(token)
    }

    /// Rewrites the tree file at commit, dropping all unused bytes
    pub fn vacuum(&mut self, tr: &mut dyn Transaction) -> Result<()> {
        if !self.add_paths.is_empty() {
            return Err(FileIndexError::programming(
                "a manual vacuum cannot also add files",
            ));
        }
        self.force_vacuum = true;
        self.register(tr);
        Ok(())
    }

    /// Ages the garbage list and deletes files whose time has come
    ///
    /// With `force`, every garbage file is deleted. Returns whether the
    /// garbage list changed, in which case the docket is rewritten at commit.
    pub fn garbage_collect(&mut self, tr: &mut dyn Transaction, force: bool) -> Result<bool> {
        let entries = self
            .staged_garbage
            .as_ref()
            .unwrap_or(&self.docket.garbage_entries)
            .clone();
        if entries.is_empty() {
            return Ok(false);
        }

        let now = self.clock.now();
        let retention_s = self.config.gc_retention_s;
        let mut changed = false;
        let mut kept = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if entry.ttl > 0 {
                entry.ttl -= 1;
                changed = true;
            }
            if !force && !entry.is_eligible(now, retention_s) {
                kept.push(entry);
                continue;
            }

            match self.store.try_unlink(&entry.path) {
                Ok(()) => {
                    tracing::info!(path = %entry.path, "deleted garbage file");
                    changed = true;
                }
                Err(err) => {
                    tracing::warn!(path = %entry.path, error = %err, "failed to delete garbage file");
                    kept.push(entry);
                }
            }
        }
        if changed {
            self.staged_garbage = Some(kept);
            self.register(tr);
        }
        Ok(changed)
    }

    fn register(&self, tr: &mut dyn Transaction) {
        tr.add_file_generator(GENERATOR_ID, &[DOCKET_FILE], true);
    }

    fn has_pending_data(&self) -> bool {
        !self.add_paths.is_empty() || !self.remove_tokens.is_empty() || self.force_vacuum
    }

    /// Drops every staged change, going back to the last published state
    pub fn discard_pending(&mut self) {
        self.add_paths.clear();
        self.remove_tokens.clear();
        self.force_vacuum = false;
        self.staged_garbage = None;
        self.prepared = None;
    }

    fn should_vacuum(&self) -> bool {
        if self.force_vacuum {
            return true;
        }

        match self.config.vacuum_mode {
            VacuumMode::Always => true,
            VacuumMode::Never => false,
            VacuumMode::Auto => {
                let size = self.docket.tree_file_size;
                if size < AUTO_VACUUM_MIN_SIZE {
                    return false;
                }
                let unused = self.docket.tree_unused_bytes;
                f64::from(unused) / f64::from(size) >= self.config.max_unused_ratio
            }
        }
    }

    /// Writes staged changes to the data files and returns `docket` updated
    /// to describe them
    fn write_data(&self, mut docket: Docket, tr: &mut dyn Transaction) -> Result<Docket> {
        let view = Arc::clone(&self.view);
        let removing = !self.remove_tokens.is_empty();
        if removing && !self.add_paths.is_empty() {
            return Err(FileIndexError::programming(
                "cannot add and remove in the same transaction",
            ));
        }
        if !removing && self.add_paths.is_empty() && view.tree_file().is_empty() {
            // Vacuuming an empty index
            return Ok(docket);
        }

        let (paths, first_token) = if removing {
            let mut paths = Vec::with_capacity(view.len());
            for item in view.items() {
                let (info, token) = item?;
                if !self.remove_tokens.contains(&token) {
                    paths.push(info.path());
                }
            }
            (paths, 1)
        } else {
            let paths: Vec<&[u8]> = self.add_paths.iter().map(Vec::as_slice).collect();
            (paths, view.token_count())
        };

        let vacuum = self.should_vacuum();
        let new_list = removing || docket.list_file_id.is_unset();
        let new_meta = removing || docket.meta_file_id.is_unset();
        let new_tree = removing || vacuum || docket.tree_file_id.is_unset();
        let garbage_timestamp = self
            .config
            .garbage_timestamp
            .unwrap_or_else(|| self.clock.now());

        let mut tree = if removing {
            MutableTree::empty(paths.len())
        } else {
            MutableTree::with_base(&view, paths.len())?
        };

        let list_start = if new_list {
            0
        } else {
            docket.list_file_size as usize
        };
        let mut list_bytes = Vec::new();
        let mut meta_bytes = Vec::new();
        if new_meta {
            Metadata::SENTINEL.write_to(&mut meta_bytes);
        }
        for (i, &path) in paths.iter().enumerate() {
            let offset = u32::try_from(list_start + list_bytes.len())
                .map_err(|_| FileIndexError::programming("list file is too large"))?;
            Metadata::for_path(path, offset).write_to(&mut meta_bytes);
            list_bytes.extend_from_slice(path);
            list_bytes.push(0);
            tree.insert(path, FileToken(first_token + i as u32))?;
        }

        for (kind, new, bytes) in [
            (DataFileKind::List, new_list, &list_bytes),
            (DataFileKind::Meta, new_meta, &meta_bytes),
        ] {
            if !new && bytes.is_empty() {
                continue;
            }
            let (name, mut file) =
                self.open_data_file(&mut docket, kind, new, garbage_timestamp, tr)?;
            let path = self.store.path(&name);
            file.write_all(bytes).with_path(&path)?;
            file.sync_data().with_path(&path)?;
            let size = docket.file_size(kind) as usize + bytes.len();
            let size = u32::try_from(size)
                .map_err(|_| FileIndexError::programming("data file is too large"))?;
            docket.set_file(kind, docket.file_id(kind), size);
        }

        let mode = if new_tree {
            SerializeMode::Vacuum
        } else {
            SerializeMode::Append
        };
        let serialized = match tree.serialize(mode)? {
            Some(serialized) => serialized,
            // Every path was removed
            None => SerializedTree {
                bytes: EMPTY_TREE_BYTES.to_vec(),
                tree_file_size: EMPTY_TREE_BYTES.len() as u32,
                tree_root_pointer: 0,
                tree_unused_bytes: 0,
            },
        };
        let (name, mut file) =
            self.open_data_file(&mut docket, DataFileKind::Tree, new_tree, garbage_timestamp, tr)?;
        let path = self.store.path(&name);
        file.write_all(&serialized.bytes).with_path(&path)?;
        file.sync_data().with_path(&path)?;
        docket.tree_file_size = serialized.tree_file_size;
        docket.tree_root_pointer = serialized.tree_root_pointer;
        docket.tree_unused_bytes = serialized.tree_unused_bytes;
        docket.reserved_flags = 0;

        if vacuum && !removing {
            tracing::info!(
                old_size = self.docket.tree_file_size,
                new_size = docket.tree_file_size,
                saved = self.docket.tree_unused_bytes,
                "vacuumed file index tree"
            );
        }
        tracing::debug!(
            paths = paths.len(),
            removing,
            tree_file_size = docket.tree_file_size,
            tree_unused_bytes = docket.tree_unused_bytes,
            "wrote file index data"
        );
        Ok(docket)
    }

    /// Opens a data file for writing
    ///
    /// A new file gets a fresh id and is journaled for rollback; the file it
    /// replaces goes on the garbage list. Otherwise the current file is opened
    /// at its used size.
    fn open_data_file(
        &self,
        docket: &mut Docket,
        kind: DataFileKind,
        new: bool,
        garbage_timestamp: u32,
        tr: &mut dyn Transaction,
    ) -> Result<(String, File)> {
        if !new {
            let name = docket
                .data_file_path(kind)
                .ok_or_else(|| FileIndexError::programming("appending to a missing data file"))?;
            let used_size = u64::from(docket.file_size(kind));
            tr.add(&name, used_size);
            let file = self.store.open_for_append(&name, used_size)?;
            return Ok((name, file));
        }

        if let Some(old) = docket.data_file_path(kind) {
            docket.garbage_entries.push(GarbageEntry::new(
                INITIAL_GARBAGE_TTL,
                garbage_timestamp,
                old,
            ));
        }
        docket.set_file(kind, FileUid::random(), 0);
        let name = docket
            .data_file_path(kind)
            .ok_or_else(|| FileIndexError::programming("new data file has no id"))?;
        tr.add(&name, 0);
        let file = self.store.create(&name)?;
        Ok((name, file))
    }
}

impl FileGenerator for FileIndex {
    fn generator_id(&self) -> &str {
        GENERATOR_ID
    }

    fn generate(&mut self, tr: &mut dyn Transaction, outputs: &mut [Vec<u8>]) -> Result<()> {
        let Some(out) = outputs.first_mut() else {
            return Err(FileIndexError::programming(
                "file index generator needs an output file",
            ));
        };

        self.prepared = None;
        let mut docket = self.docket.clone();
        if let Some(garbage) = &self.staged_garbage {
            docket.garbage_entries = garbage.clone();
        }
        let (docket, view) = if self.has_pending_data() {
            let docket = self.write_data(docket, tr)?;
            let view = load_view(&self.store, &docket, self.config.load_mode)?;
            (docket, Arc::new(view))
        } else {
            (docket, Arc::clone(&self.view))
        };

        out.extend_from_slice(&docket.serialize());
        self.prepared = Some(Prepared { docket, view });
        Ok(())
    }

    fn committed(&mut self) {
        if let Some(prepared) = self.prepared.take() {
            self.docket = prepared.docket;
            self.view = prepared.view;
        }
        self.discard_pending();
    }

    fn rolled_back(&mut self) {
        self.discard_pending();
    }
}

fn read_docket(store: &Store, try_pending: bool) -> Result<Docket> {
    let mut bytes = None;
    if try_pending {
        bytes = store
            .try_read(PENDING_DOCKET_FILE)?
            .filter(|bytes| !bytes.is_empty());
    }
    if bytes.is_none() {
        bytes = store.try_read(DOCKET_FILE)?;
    }

    match bytes {
        Some(bytes) => Ok(Docket::parse(&bytes)?),
        None => Ok(Docket::default()),
    }
}

fn load_view(store: &Store, docket: &Docket, mode: LoadMode) -> Result<FileIndexView> {
    let load = |kind: DataFileKind| -> Result<Box<dyn DataSource>> {
        match docket.data_file_path(kind) {
            Some(name) => store.load(&name, mode),
            None => Ok(Box::new(bytes::Bytes::new())),
        }
    };

    Ok(FileIndexView::open(
        docket,
        load(DataFileKind::List)?,
        load(DataFileKind::Meta)?,
        load(DataFileKind::Tree)?,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::areas::transaction::StoreTransaction;
    use crate::artifacts::core::clock::FixedClock;
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    const NOW: u32 = 1_000_000;

    struct TestStore {
        _dir: TempDir,
        store: Store,
    }

    #[fixture]
    fn test_store() -> TestStore {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().into());
        TestStore { _dir: dir, store }
    }

    fn open_with(store: &Store, config: Config) -> FileIndex {
        FileIndex::open(store.clone(), false, config, Box::new(FixedClock::new(NOW))).unwrap()
    }

    fn open(store: &Store) -> FileIndex {
        open_with(store, Config::default())
    }

    fn add_all(index: &mut FileIndex, store: &Store, paths: &[&[u8]]) -> Vec<FileToken> {
        let mut tr = StoreTransaction::begin(store).unwrap();
        let tokens = paths
            .iter()
            .map(|path| index.add(path, &mut tr).unwrap().0)
            .collect();
        tr.commit(&mut [index]).unwrap();
        tokens
    }

    fn remove_all(index: &mut FileIndex, store: &Store, paths: &[&[u8]]) {
        let mut tr = StoreTransaction::begin(store).unwrap();
        for path in paths {
            index.remove(path, &mut tr).unwrap();
        }
        tr.commit(&mut [index]).unwrap();
    }

    fn items(index: &FileIndex) -> Vec<(Vec<u8>, u32)> {
        index
            .iter()
            .map(|item| item.map(|(path, token)| (path.to_vec(), token.0)))
            .collect::<Result<_>>()
            .unwrap()
    }

    #[rstest]
    fn empty_index(test_store: TestStore) {
        let index = open(&test_store.store);
        assert!(index.is_empty());
        assert_eq!(index.get_token(b"foo").unwrap(), None);
        assert_eq!(index.get_path(FileToken(1)).unwrap(), None);
        assert_eq!(index.data_files(), vec!["fileindex".to_string()]);
    }

    #[rstest]
    fn add_and_reopen(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        let tokens = add_all(&mut index, store, &[b"foo", b"bar", b"fool", b"baz", b"ba"]);
        assert_eq!(tokens, (1..=5).map(FileToken).collect::<Vec<_>>());

        let index = open(store);
        assert_eq!(index.len(), 5);
        assert_eq!(index.get_path(FileToken(5)).unwrap(), Some(&b"ba"[..]));
        assert_eq!(index.get_token(b"bar").unwrap(), Some(FileToken(2)));
        assert_eq!(index.get_token(b"ba").unwrap(), Some(FileToken(5)));
        assert_eq!(index.get_token(b"foo").unwrap(), Some(FileToken(1)));
        assert_eq!(index.get_token(b"food").unwrap(), None);
        assert_eq!(index.data_files().len(), 4);
    }

    #[rstest]
    fn add_is_idempotent(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"a"]);

        let mut tr = StoreTransaction::begin(store).unwrap();
        assert_eq!(index.add(b"a", &mut tr).unwrap(), (FileToken(1), false));
        assert!(!tr.has_file_generator(GENERATOR_ID));
        assert_eq!(index.add(b"b", &mut tr).unwrap(), (FileToken(2), true));
        assert_eq!(index.add(b"b", &mut tr).unwrap(), (FileToken(2), false));
        assert!(tr.has_file_generator(GENERATOR_ID));
        tr.commit(&mut [&mut index]).unwrap();
    }

    #[rstest]
    fn pending_adds_are_visible(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"one"]);

        let mut tr = StoreTransaction::begin(store).unwrap();
        index.add(b"two", &mut tr).unwrap();
        assert_eq!(index.get_token(b"two").unwrap(), Some(FileToken(2)));
        assert_eq!(index.get_path(FileToken(2)).unwrap(), Some(&b"two"[..]));
        assert_eq!(index.len(), 2);
        // Readers of the committed state don't see it
        assert_eq!(index.snapshot().get_token(b"two").unwrap(), None);
        tr.abort(&mut [&mut index]);
    }

    #[rstest]
    fn append_keeps_earlier_tokens(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"dir/a", b"dir/b"]);
        let first_ids = index.data_files();

        add_all(&mut index, store, &[b"dir/c", b"other"]);
        // No vacuum, so the same files were appended to
        assert_eq!(index.data_files(), first_ids);
        assert!(index.docket().tree_unused_bytes > 0);

        let index = open(store);
        assert_eq!(
            items(&index),
            vec![
                (b"dir/a".to_vec(), 1),
                (b"dir/b".to_vec(), 2),
                (b"dir/c".to_vec(), 3),
                (b"other".to_vec(), 4),
            ]
        );
    }

    #[rstest]
    fn remove_renumbers_tokens(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"a", b"b", b"c"]);
        let old_files = index.data_files();

        remove_all(&mut index, store, &[b"b"]);
        assert_eq!(items(&index), vec![(b"a".to_vec(), 1), (b"c".to_vec(), 2)]);
        assert_eq!(index.get_token(b"b").unwrap(), None);

        // All three data files were replaced and the old ones queued as garbage
        let garbage: Vec<_> = index
            .docket()
            .garbage_entries
            .iter()
            .map(|entry| entry.path.clone())
            .collect();
        assert_eq!(garbage, old_files[1..].to_vec());
        assert!(index.docket().garbage_entries.iter().all(|e| e.ttl == 2 && e.timestamp == NOW));

        let index = open(store);
        assert_eq!(items(&index), vec![(b"a".to_vec(), 1), (b"c".to_vec(), 2)]);
    }

    #[rstest]
    fn remove_everything(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"x", b"y"]);
        remove_all(&mut index, store, &[b"x", b"y"]);

        let mut index = open(store);
        assert!(index.is_empty());
        assert_eq!(index.docket().tree_file_size, 6);

        add_all(&mut index, store, &[b"z"]);
        assert_eq!(open(store).get_token(b"z").unwrap(), Some(FileToken(1)));
    }

    #[rstest]
    fn pending_removal_hides_token(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"a", b"b"]);

        let mut tr = StoreTransaction::begin(store).unwrap();
        assert_eq!(index.remove(b"a", &mut tr).unwrap(), FileToken(1));
        assert!(!index.has_token(FileToken(1)));
        assert!(!index.has_path(b"a").unwrap());
        assert_eq!(index.len(), 1);
        tr.abort(&mut [&mut index]);
    }

    #[rstest]
    fn remove_missing_path_is_not_found(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        let mut tr = StoreTransaction::begin(store).unwrap();
        let err = index.remove(b"nope", &mut tr).unwrap_err();
        assert!(err.is_not_found());
        assert!(!tr.has_file_generator(GENERATOR_ID));
    }

    #[rstest]
    fn add_and_remove_cannot_mix(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"a"]);

        let mut tr = StoreTransaction::begin(store).unwrap();
        index.add(b"b", &mut tr).unwrap();
        assert!(index.remove(b"a", &mut tr).unwrap_err().is_programming());
        assert!(index.vacuum(&mut tr).unwrap_err().is_programming());
        tr.abort(&mut [&mut index]);

        let mut index = open(store);
        let mut tr = StoreTransaction::begin(store).unwrap();
        index.remove(b"a", &mut tr).unwrap();
        assert!(index.add(b"c", &mut tr).unwrap_err().is_programming());
        tr.abort(&mut [&mut index]);
    }

    #[rstest]
    #[case(b"")]
    #[case(b"nul\0byte")]
    fn add_rejects_invalid_paths(test_store: TestStore, #[case] path: &[u8]) {
        let store = &test_store.store;
        let mut index = open(store);
        let mut tr = StoreTransaction::begin(store).unwrap();
        assert!(index.add(path, &mut tr).unwrap_err().is_not_found());
    }

    #[rstest]
    fn vacuum_drops_unused_bytes(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        for i in 0..10 {
            let path = format!("file{i}");
            add_all(&mut index, store, &[path.as_bytes()]);
        }
        let before = index.docket().clone();
        assert!(before.tree_unused_bytes > 0);

        let mut tr = StoreTransaction::begin(store).unwrap();
        index.vacuum(&mut tr).unwrap();
        tr.commit(&mut [&mut index]).unwrap();

        let after = index.docket();
        assert_eq!(after.tree_unused_bytes, 0);
        assert_eq!(
            before.tree_file_size - after.tree_file_size,
            before.tree_unused_bytes
        );
        assert_ne!(after.tree_file_id, before.tree_file_id);
        assert_eq!(after.list_file_id, before.list_file_id);
        assert_eq!(after.garbage_entries.len(), 1);

        let index = open(store);
        for i in 0..10 {
            let path = format!("file{i}");
            assert_eq!(index.get_token(path.as_bytes()).unwrap(), Some(FileToken(i + 1)));
        }
    }

    #[rstest]
    fn vacuum_of_empty_index_writes_nothing(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        let mut tr = StoreTransaction::begin(store).unwrap();
        index.vacuum(&mut tr).unwrap();
        tr.commit(&mut [&mut index]).unwrap();
        assert_eq!(index.docket(), &Docket::default());
    }

    #[rstest]
    fn always_vacuum_mode(test_store: TestStore) {
        let store = &test_store.store;
        let config = Config {
            vacuum_mode: VacuumMode::Always,
            ..Config::default()
        };
        let mut index = open_with(store, config);
        add_all(&mut index, store, &[b"a"]);
        add_all(&mut index, store, &[b"b"]);
        assert_eq!(index.docket().tree_unused_bytes, 0);
        assert_eq!(index.docket().garbage_entries.len(), 1);
    }

    #[rstest]
    fn auto_vacuum_needs_a_large_tree(test_store: TestStore) {
        let store = &test_store.store;
        let config = Config {
            max_unused_ratio: 0.01,
            ..Config::default()
        };
        let mut index = open_with(store, config);
        add_all(&mut index, store, &[b"a"]);
        add_all(&mut index, store, &[b"b"]);
        add_all(&mut index, store, &[b"c"]);
        // Well over 1% unused, but far below the size threshold
        assert!(index.docket().tree_unused_bytes > 0);
        assert!(index.docket().garbage_entries.is_empty());
    }

    #[rstest]
    fn auto_vacuum_rewrites_a_large_tree(test_store: TestStore) {
        let store = &test_store.store;
        let config = Config {
            max_unused_ratio: 0.1,
            ..Config::default()
        };
        let mut index = open_with(store, config);
        let mut count = 0;
        while index.docket().tree_file_size < AUTO_VACUUM_MIN_SIZE {
            count += 1;
            assert!(count < 1000, "tree never reached the vacuum size");
            let path = format!("dir/file{count:04}");
            add_all(&mut index, store, &[path.as_bytes()]);
            assert!(index.docket().garbage_entries.is_empty());
        }
        let before = index.docket().clone();
        assert!(f64::from(before.tree_unused_bytes) / f64::from(before.tree_file_size) >= 0.1);

        add_all(&mut index, store, &[b"last"]);
        let after = index.docket();
        assert_ne!(after.tree_file_id, before.tree_file_id);
        assert_eq!(after.tree_unused_bytes, 0);
        assert_eq!(after.list_file_id, before.list_file_id);
        let old_tree = before.data_file_path(DataFileKind::Tree).unwrap();
        assert_eq!(
            after
                .garbage_entries
                .iter()
                .map(|entry| entry.path.as_str())
                .collect::<Vec<_>>(),
            vec![old_tree.as_str()]
        );

        let index = open(store);
        assert_eq!(index.len(), count + 1);
        assert_eq!(index.get_token(b"last").unwrap(), Some(FileToken(count as u32 + 1)));
        assert_eq!(index.get_token(b"dir/file0001").unwrap(), Some(FileToken(1)));
    }

    #[rstest]
    #[case(AUTO_VACUUM_MIN_SIZE, AUTO_VACUUM_MIN_SIZE / 4, true)]
    #[case(AUTO_VACUUM_MIN_SIZE, AUTO_VACUUM_MIN_SIZE / 4 - 1, false)]
    #[case(AUTO_VACUUM_MIN_SIZE * 2, AUTO_VACUUM_MIN_SIZE, true)]
    #[case(AUTO_VACUUM_MIN_SIZE - 1, AUTO_VACUUM_MIN_SIZE - 1, false)]
    fn auto_vacuum_threshold(
        test_store: TestStore,
        #[case] tree_file_size: u32,
        #[case] tree_unused_bytes: u32,
        #[case] expected: bool,
    ) {
        let config = Config {
            max_unused_ratio: 0.25,
            ..Config::default()
        };
        let mut index = open_with(&test_store.store, config);
        index.docket.tree_file_size = tree_file_size;
        index.docket.tree_unused_bytes = tree_unused_bytes;
        assert_eq!(index.should_vacuum(), expected);
    }

    #[rstest]
    fn garbage_waits_for_ttl_and_retention(test_store: TestStore) {
        let store = &test_store.store;
        let config = Config {
            vacuum_mode: VacuumMode::Always,
            garbage_timestamp: Some(NOW - 10),
            gc_retention_s: 5,
            ..Config::default()
        };
        let mut index = open_with(store, config);
        add_all(&mut index, store, &[b"a"]);
        add_all(&mut index, store, &[b"b"]);
        let garbage = index.docket().garbage_entries[0].path.clone();
        assert!(store.exists(&garbage));

        for expected_ttl in [1, 0] {
            let mut tr = StoreTransaction::begin(store).unwrap();
            assert!(index.garbage_collect(&mut tr, false).unwrap());
            tr.commit(&mut [&mut index]).unwrap();
            if expected_ttl > 0 {
                assert_eq!(index.docket().garbage_entries[0].ttl, expected_ttl);
                assert!(store.exists(&garbage));
            }
        }
        // TTL reached zero and NOW is past timestamp + retention
        assert!(index.docket().garbage_entries.is_empty());
        assert!(!store.exists(&garbage));

        let mut tr = StoreTransaction::begin(store).unwrap();
        assert!(!index.garbage_collect(&mut tr, false).unwrap());
        assert!(!tr.has_file_generator(GENERATOR_ID));
    }

    #[rstest]
    fn garbage_within_retention_is_kept(test_store: TestStore) {
        let store = &test_store.store;
        let config = Config {
            vacuum_mode: VacuumMode::Always,
            gc_retention_s: 3600,
            ..Config::default()
        };
        let mut index = open_with(store, config);
        add_all(&mut index, store, &[b"a"]);
        add_all(&mut index, store, &[b"b"]);

        for _ in 0..4 {
            let mut tr = StoreTransaction::begin(store).unwrap();
            index.garbage_collect(&mut tr, false).unwrap();
            tr.commit(&mut [&mut index]).unwrap();
        }
        let entries = &index.docket().garbage_entries;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ttl, 0);
        assert!(store.exists(&entries[0].path));
    }

    #[rstest]
    fn forced_garbage_collection(test_store: TestStore) {
        let store = &test_store.store;
        let config = Config {
            vacuum_mode: VacuumMode::Always,
            ..Config::default()
        };
        let mut index = open_with(store, config);
        add_all(&mut index, store, &[b"a"]);
        add_all(&mut index, store, &[b"b"]);
        let garbage = index.docket().garbage_entries[0].path.clone();

        let mut tr = StoreTransaction::begin(store).unwrap();
        assert!(index.garbage_collect(&mut tr, true).unwrap());
        tr.commit(&mut [&mut index]).unwrap();
        assert!(index.docket().garbage_entries.is_empty());
        assert!(!store.exists(&garbage));
        assert!(open(store).docket().garbage_entries.is_empty());
    }

    #[rstest]
    fn aborted_write_leaves_no_files(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"a", b"b"]);
        let files = index.data_files();
        let docket = index.docket().clone();

        let mut tr = StoreTransaction::begin(store).unwrap();
        index.remove(b"a", &mut tr).unwrap();
        index.generate(&mut tr, &mut [Vec::new()]).unwrap();
        // Generating alone publishes nothing
        assert_eq!(index.docket(), &docket);
        tr.abort(&mut [&mut index]);

        // The rewritten data files were rolled back; the docket never changed
        let mut on_disk: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.starts_with("fileindex"))
            .collect();
        on_disk.sort();
        let mut expected = files;
        expected.sort();
        assert_eq!(on_disk, expected);
        assert_eq!(open(store).get_token(b"a").unwrap(), Some(FileToken(1)));

        // The live index still matches the disk and can keep writing
        assert_eq!(index.docket(), &docket);
        assert_eq!(items(&index), vec![(b"a".to_vec(), 1), (b"b".to_vec(), 2)]);
        assert_eq!(add_all(&mut index, store, &[b"c"]), vec![FileToken(3)]);
        assert_eq!(
            items(&open(store)),
            vec![(b"a".to_vec(), 1), (b"b".to_vec(), 2), (b"c".to_vec(), 3)]
        );
    }

    struct FailingGenerator;

    impl FileGenerator for FailingGenerator {
        fn generator_id(&self) -> &str {
            "failing"
        }

        fn generate(&mut self, _tr: &mut dyn Transaction, _outputs: &mut [Vec<u8>]) -> Result<()> {
            Err(FileIndexError::programming("cannot generate"))
        }
    }

    #[rstest]
    fn failed_commit_keeps_the_published_state(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"a", b"b"]);
        let published = store.try_read(DOCKET_FILE).unwrap();

        let mut tr = StoreTransaction::begin(store).unwrap();
        index.remove(b"a", &mut tr).unwrap();
        tr.add_file_generator("failing", &["other"], true);
        let err = tr.commit(&mut [&mut index, &mut FailingGenerator]).unwrap_err();
        assert!(err.is_programming());

        assert_eq!(store.try_read(DOCKET_FILE).unwrap(), published);
        assert_eq!(index.get_token(b"a").unwrap(), Some(FileToken(1)));

        remove_all(&mut index, store, &[b"a"]);
        assert_eq!(items(&open(store)), vec![(b"b".to_vec(), 1)]);
    }

    #[rstest]
    fn aborted_garbage_collection_keeps_the_list(test_store: TestStore) {
        let store = &test_store.store;
        let config = Config {
            vacuum_mode: VacuumMode::Always,
            ..Config::default()
        };
        let mut index = open_with(store, config);
        add_all(&mut index, store, &[b"a"]);
        add_all(&mut index, store, &[b"b"]);

        let mut tr = StoreTransaction::begin(store).unwrap();
        assert!(index.garbage_collect(&mut tr, false).unwrap());
        assert_eq!(index.docket().garbage_entries[0].ttl, INITIAL_GARBAGE_TTL);
        tr.abort(&mut [&mut index]);
        assert_eq!(index.docket().garbage_entries[0].ttl, INITIAL_GARBAGE_TTL);

        let mut tr = StoreTransaction::begin(store).unwrap();
        index.garbage_collect(&mut tr, false).unwrap();
        tr.commit(&mut [&mut index]).unwrap();
        assert_eq!(index.docket().garbage_entries[0].ttl, INITIAL_GARBAGE_TTL - 1);
        assert_eq!(open(store).docket(), index.docket());
    }

    #[rstest]
    fn pending_docket_is_written_before_commit(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"a"]);

        let config = Config::default();
        let clock = || Box::new(FixedClock::new(NOW));
        let mut tr = StoreTransaction::begin(store).unwrap();
        index.add(b"b", &mut tr).unwrap();
        tr.write_pending(&mut [&mut index]).unwrap();
        assert!(store.exists(PENDING_DOCKET_FILE));

        let plain = FileIndex::open(store.clone(), false, config.clone(), clock()).unwrap();
        let pending = FileIndex::open(store.clone(), true, config.clone(), clock()).unwrap();
        assert_eq!(plain.len(), 1);
        assert_eq!(pending.get_token(b"b").unwrap(), Some(FileToken(2)));

        tr.commit(&mut [&mut index]).unwrap();
        assert!(!store.exists(PENDING_DOCKET_FILE));
        assert_eq!(index.snapshot().get_token(b"b").unwrap(), Some(FileToken(2)));
        let reopened = FileIndex::open(store.clone(), true, config, clock()).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[rstest]
    fn pending_docket_is_preferred(test_store: TestStore) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"a"]);
        let published = store.try_read(DOCKET_FILE).unwrap().unwrap();

        add_all(&mut index, store, &[b"b"]);
        let pending = store.try_read(DOCKET_FILE).unwrap().unwrap();
        store.write_atomic(PENDING_DOCKET_FILE, &pending).unwrap();
        store.write_atomic(DOCKET_FILE, &published).unwrap();

        let config = Config::default();
        let clock = || Box::new(FixedClock::new(NOW));
        let plain = FileIndex::open(store.clone(), false, config.clone(), clock()).unwrap();
        let with_pending = FileIndex::open(store.clone(), true, config, clock()).unwrap();
        assert_eq!(plain.len(), 1);
        assert_eq!(with_pending.len(), 2);
    }

    #[rstest]
    fn corrupt_docket_is_reported(test_store: TestStore) {
        let store = &test_store.store;
        store.write_atomic(DOCKET_FILE, b"not a docket").unwrap();
        let result = FileIndex::open(
            store.clone(),
            false,
            Config::default(),
            Box::new(FixedClock::new(NOW)),
        );
        assert!(result.err().unwrap().is_corruption());
    }

    #[rstest]
    fn zero_ratio_is_a_programming_error(test_store: TestStore) {
        let config = Config {
            max_unused_ratio: 0.0,
            ..Config::default()
        };
        let result = FileIndex::open(
            test_store.store.clone(),
            false,
            config,
            Box::new(FixedClock::new(NOW)),
        );
        assert!(result.err().unwrap().is_programming());
    }

    #[rstest]
    #[case(LoadMode::Mmap)]
    #[case(LoadMode::Read)]
    fn load_modes_agree(test_store: TestStore, #[case] load_mode: LoadMode) {
        let store = &test_store.store;
        let mut index = open(store);
        add_all(&mut index, store, &[b"src/main.rs", b"src/lib.rs", b"README"]);

        let config = Config {
            load_mode,
            ..Config::default()
        };
        let index = open_with(store, config);
        assert_eq!(index.get_token(b"src/lib.rs").unwrap(), Some(FileToken(2)));
        let info = index.snapshot();
        let info = info.get_path_info(FileToken(2)).unwrap().unwrap();
        assert_eq!(info.dirname(), Some(&b"src"[..]));
        assert_eq!(info.basename(), b"lib.rs");
    }
}
