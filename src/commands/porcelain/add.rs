use crate::areas::repository::Repository;
use crate::areas::transaction::StoreTransaction;
use anyhow::Context;
use std::io::Write;

impl Repository {
    /// Adds `paths` to the file index and prints the token of each
    pub fn add(&mut self, paths: &[String]) -> anyhow::Result<()> {
        let store = self.store()?;
        let mut file_index = self.file_index()?;
        let mut tr = StoreTransaction::begin(&store)?;

        let mut tokens = Vec::with_capacity(paths.len());
        for path in paths {
            let (token, _) = file_index
                .add(path.as_bytes(), &mut tr)
                .with_context(|| format!("Cannot add {path:?}"))?;
            tokens.push(token);
        }
        file_index.garbage_collect(&mut tr, false)?;
        tr.commit(&mut [&mut file_index])?;

        for (token, path) in tokens.iter().zip(paths) {
            writeln!(self.writer(), "{token}: {path}")?;
        }

        Ok(())
    }
}
