//! Byte store
//!
//! Named files under the store directory (`.fidx/store`). Names are always
//! relative to the store root.

use crate::artifacts::core::config::LoadMode;
use crate::artifacts::file_index::view::DataSource;
use crate::errors::{IoResultExt, Result};
use derive_new::new;
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Directory of named files, created by `fidx init`
#[derive(Debug, Clone, new)]
pub struct Store {
    /// Directory the names are relative to (typically `.fidx/store`)
    root: Box<Path>,
}

impl Store {
    /// Directory holding the store's files
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the file called `name`
    ///
    /// # Arguments
    ///
    /// * `name` - Store-relative file name, such as `fileindex`
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Whether a file called `name` exists
    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    /// Size of a file in bytes, or None if it doesn't exist
    pub fn size(&self, name: &str) -> Result<Option<u64>> {
        let path = self.path(name);
        match std::fs::metadata(&path) {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_path(&path),
        }
    }

    /// Reads a whole file, or returns None if it doesn't exist
    pub fn try_read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(name);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_path(&path),
        }
    }

    /// Opens a data file for reading
    ///
    /// # Arguments
    ///
    /// * `name` - Store-relative file name
    /// * `mode` - Whether to memory-map the file or read it into memory
    pub fn load(&self, name: &str, mode: LoadMode) -> Result<Box<dyn DataSource>> {
        let path = self.path(name);
        let file = File::open(&path).with_path(&path)?;
        // Zero-length mappings are rejected on some platforms
        if file.metadata().with_path(&path)?.len() == 0 {
            return Ok(Box::new(bytes::Bytes::new()));
        }

        match mode {
            LoadMode::Mmap => {
                // SAFETY: data files are append-only and readers never look past
                // the used size recorded in the docket they loaded
                let mmap = unsafe { Mmap::map(&file) }.with_path(&path)?;
                Ok(Box::new(mmap))
            }
            LoadMode::Read => {
                let bytes = std::fs::read(&path).with_path(&path)?;
                Ok(Box::new(bytes::Bytes::from(bytes)))
            }
        }
    }

    /// Creates a new empty file, replacing any leftover with the same name
    pub fn create(&self, name: &str) -> Result<File> {
        let path = self.path(name);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_path(&path)
    }

    /// Opens a file for writing at `used_size`
    ///
    /// Bytes past `used_size` were never published by a docket and are
    /// overwritten.
    pub fn open_for_append(&self, name: &str, used_size: u64) -> Result<File> {
        let path = self.path(name);
        let mut file = OpenOptions::new().write(true).open(&path).with_path(&path)?;
        file.seek(SeekFrom::Start(used_size)).with_path(&path)?;
        Ok(file)
    }

    /// Cuts a file back to `size` bytes, used to undo appends
    pub fn truncate(&self, name: &str, size: u64) -> Result<()> {
        let path = self.path(name);
        let file = OpenOptions::new().write(true).open(&path).with_path(&path)?;
        file.set_len(size).with_path(&path)
    }

    /// Deletes a file; a file that is already gone is not an error
    pub fn try_unlink(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_path(&path),
        }
    }

    /// Replaces a file atomically through a temporary file and a rename
    pub fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(name);
        let mut temp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.root)
            .with_path(&self.root)?;
        temp.write_all(bytes).with_path(temp.path())?;
        temp.as_file().sync_all().with_path(temp.path())?;
        temp.persist(&path).map_err(|err| err.error).with_path(&path)?;
        Ok(())
    }
}
