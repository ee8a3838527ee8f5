//! Store transactions
//!
//! Writers stage their changes and register a [`FileGenerator`] with the
//! transaction. Nothing is published until [`StoreTransaction::commit`] runs
//! the generators and atomically replaces the files they produce. Generators
//! learn the outcome through [`FileGenerator::committed`] and
//! [`FileGenerator::rolled_back`], and only then replace their in-memory
//! state.
//!
//! New files created along the way are journaled with [`Transaction::add`] so
//! an abort can delete them (offset 0) or truncate them back to their
//! previous size.
//!
//! ## Pending files
//!
//! [`StoreTransaction::write_pending`] publishes every generated file under a
//! `.pending` name before the commit, so readers that opt in (hooks, for
//! instance) can see the transaction's result. The commit reuses those
//! outputs and removes the pending files.
//!
//! ## Locking
//!
//! A transaction holds an exclusive lock on `<store>/lock` from
//! [`StoreTransaction::begin`] until it is committed or dropped, so there is
//! at most one writer per store.

use crate::areas::store::Store;
use crate::errors::{FileIndexError, IoResultExt, Result};
use file_guard::{FileGuard, Lock};
use indexmap::IndexMap;
use std::fs::{File, OpenOptions};

/// Name of the writer lock file in the store
pub const LOCK_FILE: &str = "lock";

/// Appended to a generated filename by [`StoreTransaction::write_pending`]
pub const PENDING_SUFFIX: &str = ".pending";

/// Interface a writer sees while a transaction is open
pub trait Transaction {
    /// Journals `file` so an abort restores it to `offset` bytes, or deletes it
    /// if `offset` is 0. Only the first offset recorded for a file is kept.
    fn add(&mut self, file: &str, offset: u64);

    /// Registers generator `id` to write `filenames` at commit. Registering
    /// the same id again has no effect.
    fn add_file_generator(&mut self, id: &str, filenames: &[&str], post_finalize: bool);
}

/// Produces the final content of files at commit time
pub trait FileGenerator {
    fn generator_id(&self) -> &str;

    /// Writes one buffer per registered filename, in registration order
    ///
    /// The generator must not treat its output as published yet: the
    /// transaction may still fail or be aborted.
    fn generate(&mut self, tr: &mut dyn Transaction, outputs: &mut [Vec<u8>]) -> Result<()>;

    /// Every file of the transaction has been published
    fn committed(&mut self) {}

    /// The transaction was aborted or failed to commit
    fn rolled_back(&mut self) {}
}

#[derive(Debug, Clone)]
struct Registration {
    id: String,
    filenames: Vec<String>,
    post_finalize: bool,
}

pub struct StoreTransaction<'s> {
    store: &'s Store,
    _lock: FileGuard<Box<File>>,
    /// Journaled files and the size an abort restores them to
    journal: IndexMap<String, u64>,
    registrations: Vec<Registration>,
    /// Outputs already produced by `write_pending`, by generator id
    generated: IndexMap<String, Vec<Vec<u8>>>,
    /// Pending files to remove once the transaction ends
    pending_files: Vec<String>,
    finished: bool,
}

impl<'s> StoreTransaction<'s> {
    /// Opens a transaction, blocking until the store's writer lock is free
    pub fn begin(store: &'s Store) -> Result<Self> {
        let path = store.path(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_path(&path)?;
        let lock = file_guard::lock(Box::new(file), Lock::Exclusive, 0, 1).with_path(&path)?;

        tracing::debug!(store = %store.root().display(), "transaction started");
        Ok(StoreTransaction {
            store,
            _lock: lock,
            journal: IndexMap::new(),
            registrations: Vec::new(),
            generated: IndexMap::new(),
            pending_files: Vec::new(),
            finished: false,
        })
    }

    pub fn has_file_generator(&self, id: &str) -> bool {
        self.registrations.iter().any(|registration| registration.id == id)
    }

    /// Files journaled so far and the size an abort would restore
    pub fn journal(&self) -> impl Iterator<Item = (&str, u64)> {
        self.journal
            .iter()
            .map(|(file, offset)| (file.as_str(), *offset))
    }

    /// Registrations in the order their generators run
    fn ordered_registrations(&self) -> Vec<Registration> {
        let mut registrations = self.registrations.clone();
        registrations.sort_by_key(|registration| registration.post_finalize);
        registrations
    }

    fn run_generator(
        &mut self,
        generators: &mut [&mut dyn FileGenerator],
        registration: &Registration,
    ) -> Result<Vec<Vec<u8>>> {
        let generator = generators
            .iter_mut()
            .find(|generator| generator.generator_id() == registration.id)
            .ok_or_else(|| {
                FileIndexError::programming(format!(
                    "no file generator named {:?}",
                    registration.id
                ))
            })?;

        let mut outputs = vec![Vec::new(); registration.filenames.len()];
        generator.generate(self, &mut outputs)?;
        Ok(outputs)
    }

    /// Writes every generated file as `<name>.pending`
    ///
    /// Generators that ran here are not run again at commit. A failure
    /// leaves the transaction open; dropping or aborting it cleans up.
    pub fn write_pending(&mut self, generators: &mut [&mut dyn FileGenerator]) -> Result<()> {
        for registration in self.ordered_registrations() {
            if self.generated.contains_key(&registration.id) {
                continue;
            }

            let outputs = self.run_generator(generators, &registration)?;
            for (filename, output) in registration.filenames.iter().zip(&outputs) {
                let name = format!("{filename}{PENDING_SUFFIX}");
                self.store.write_atomic(&name, output)?;
                self.pending_files.push(name);
            }
            self.generated.insert(registration.id, outputs);
        }

        tracing::debug!(files = self.pending_files.len(), "wrote pending files");
        Ok(())
    }

    /// Runs every registered generator and publishes its files
    ///
    /// Generators registered with `post_finalize = false` run first. Every
    /// generator runs before any file is replaced, so a failing generator
    /// publishes nothing. Any failure rolls the transaction back.
    pub fn commit(mut self, generators: &mut [&mut dyn FileGenerator]) -> Result<()> {
        if let Err(err) = self.publish(generators) {
            self.rollback();
            self.notify(generators, |generator| generator.rolled_back());
            return Err(err);
        }

        self.finished = true;
        self.remove_pending_files();
        self.notify(generators, |generator| generator.committed());
        tracing::debug!(generators = self.registrations.len(), "transaction committed");
        Ok(())
    }

    fn publish(&mut self, generators: &mut [&mut dyn FileGenerator]) -> Result<()> {
        let registrations = self.ordered_registrations();
        let mut generated = Vec::with_capacity(registrations.len());
        for registration in &registrations {
            let outputs = match self.generated.shift_remove(&registration.id) {
                Some(outputs) => outputs,
                None => self.run_generator(generators, registration)?,
            };
            generated.push(outputs);
        }

        for (registration, outputs) in registrations.iter().zip(&generated) {
            for (filename, output) in registration.filenames.iter().zip(outputs) {
                self.store.write_atomic(filename, output)?;
            }
        }
        Ok(())
    }

    /// Calls `hook` on every generator registered with this transaction
    fn notify(
        &self,
        generators: &mut [&mut dyn FileGenerator],
        hook: impl Fn(&mut dyn FileGenerator),
    ) {
        for generator in generators.iter_mut() {
            if self.has_file_generator(generator.generator_id()) {
                hook(&mut **generator);
            }
        }
    }

    /// Undoes journaled file changes and tells the generators
    ///
    /// Rollback failures are logged and skipped.
    pub fn abort(mut self, generators: &mut [&mut dyn FileGenerator]) {
        self.rollback();
        self.notify(generators, |generator| generator.rolled_back());
    }

    fn rollback(&mut self) {
        for (file, offset) in self.journal.drain(..).rev() {
            let result = match offset {
                0 => self.store.try_unlink(&file),
                _ => self.store.truncate(&file, offset),
            };
            if let Err(err) = result {
                tracing::warn!(file = %file, error = %err, "failed to roll back file");
            }
        }
        self.remove_pending_files();
        self.finished = true;
        tracing::debug!("transaction aborted");
    }

    fn remove_pending_files(&mut self) {
        for name in self.pending_files.drain(..) {
            if let Err(err) = self.store.try_unlink(&name) {
                tracing::warn!(file = %name, error = %err, "failed to remove pending file");
            }
        }
    }
}

impl Transaction for StoreTransaction<'_> {
    fn add(&mut self, file: &str, offset: u64) {
        self.journal.entry(file.to_string()).or_insert(offset);
    }

    fn add_file_generator(&mut self, id: &str, filenames: &[&str], post_finalize: bool) {
        if self.has_file_generator(id) {
            return;
        }
        self.registrations.push(Registration {
            id: id.to_string(),
            filenames: filenames.iter().map(|name| name.to_string()).collect(),
            post_finalize,
        });
    }
}

impl Drop for StoreTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("transaction dropped without commit, rolling back");
            self.rollback();
        }
    }
}
