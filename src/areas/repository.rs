use crate::areas::file_index::FileIndex;
use crate::areas::store::Store;
use crate::artifacts::core::clock::SystemClock;
use crate::artifacts::core::config::Config;
use anyhow::Context;
use std::cell::{RefCell, RefMut};
use std::path::{Path, PathBuf};

/// Name of the repository metadata directory
pub const FIDX_DIR: &str = ".fidx";

pub struct Repository {
    path: Box<Path>,
    writer: RefCell<Box<dyn std::io::Write>>,
}

impl Repository {
    pub fn new(path: &str, writer: Box<dyn std::io::Write>) -> anyhow::Result<Self> {
        let path = Path::new(path);
        if !path.exists() {
            std::fs::create_dir_all(path)
                .with_context(|| format!("Failed to create directory {}", path.display()))?;
        }
        let path = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", path.display()))?;

        Ok(Repository {
            path: path.into_boxed_path(),
            writer: RefCell::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writer(&'_ self) -> RefMut<'_, Box<dyn std::io::Write>> {
        self.writer.borrow_mut()
    }

    pub fn fidx_path(&self) -> PathBuf {
        self.path.join(FIDX_DIR)
    }

    pub fn store_path(&self) -> PathBuf {
        self.fidx_path().join("store")
    }

    pub fn config_path(&self) -> PathBuf {
        self.fidx_path().join("config.toml")
    }

    pub fn store(&self) -> anyhow::Result<Store> {
        let store_path = self.store_path();
        if !store_path.is_dir() {
            anyhow::bail!(
                "not a fidx repository (missing {}), run `fidx init` first",
                store_path.display()
            );
        }

        Ok(Store::new(store_path.into_boxed_path()))
    }

    pub fn config(&self) -> anyhow::Result<Config> {
        Config::load(&self.config_path())
    }

    /// Opens the file index with the repository's configuration
    pub fn file_index(&self) -> anyhow::Result<FileIndex> {
        let store = self.store()?;
        let config = self.config()?;
        FileIndex::open(store, false, config, Box::new(SystemClock))
            .context("Failed to open the file index")
    }
}
