use crate::areas::repository::Repository;
use anyhow::Context;
use std::fs;
use std::io::Write;

impl Repository {
    pub fn init(&mut self) -> anyhow::Result<()> {
        let store_path = self.store_path();
        fs::create_dir_all(&store_path)
            .with_context(|| format!("Failed to create {}", store_path.display()))?;

        writeln!(
            self.writer(),
            "Initialized empty fidx repository in {}",
            self.fidx_path().display()
        )?;

        Ok(())
    }
}
