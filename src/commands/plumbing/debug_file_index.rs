use crate::areas::file_index::FileIndex;
use crate::areas::repository::Repository;
use crate::areas::transaction::StoreTransaction;
use crate::artifacts::file_index::FileToken;
use crate::artifacts::file_index::docket::{DataFileKind, FORMAT_MARKER};
use crate::artifacts::file_index::tree_node::ChildRef;
use colored::Colorize;
use std::io::Write;

/// What `debug-file-index` should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugFileIndexAction {
    /// List every `token: path` pair
    List,
    Docket,
    Tree,
    Path(String),
    Token(u32),
    Vacuum,
    /// Delete every garbage file now
    Gc,
}

impl Repository {
    pub fn debug_file_index(&mut self, action: DebugFileIndexAction) -> anyhow::Result<()> {
        let mut file_index = self.file_index()?;

        match action {
            DebugFileIndexAction::List => {
                for item in file_index.iter() {
                    let (path, token) = item?;
                    self.write_entry(token, path)?;
                }
            }
            DebugFileIndexAction::Docket => self.dump_docket(&file_index)?,
            DebugFileIndexAction::Tree => self.dump_tree(&file_index)?,
            DebugFileIndexAction::Path(path) => {
                let token = file_index
                    .get_token(path.as_bytes())?
                    .ok_or_else(|| anyhow::anyhow!("path {path} is not in the file index"))?;
                self.write_entry(token, path.as_bytes())?;
            }
            DebugFileIndexAction::Token(token) => {
                let token = FileToken(token);
                let path = file_index
                    .get_path(token)?
                    .ok_or_else(|| anyhow::anyhow!("token {token} is not in the file index"))?;
                self.write_entry(token, path)?;
            }
            DebugFileIndexAction::Vacuum => {
                let store = self.store()?;
                let old_size = file_index.docket().tree_file_size;
                let mut tr = StoreTransaction::begin(&store)?;
                file_index.vacuum(&mut tr)?;
                tr.commit(&mut [&mut file_index])?;
                let new_size = file_index.docket().tree_file_size;

                let saved = match old_size {
                    0 => 0.0,
                    _ => f64::from(old_size.saturating_sub(new_size)) / f64::from(old_size) * 100.0,
                };
                writeln!(
                    self.writer(),
                    "vacuumed tree: {} => {} (saved {:.1}%)",
                    byte_count(old_size),
                    byte_count(new_size),
                    saved
                )?;
            }
            DebugFileIndexAction::Gc => {
                let store = self.store()?;
                let mut tr = StoreTransaction::begin(&store)?;
                file_index.garbage_collect(&mut tr, true)?;
                tr.commit(&mut [&mut file_index])?;
            }
        }

        Ok(())
    }

    fn write_entry(&self, token: FileToken, path: &[u8]) -> anyhow::Result<()> {
        writeln!(
            self.writer(),
            "{}: {}",
            token.to_string().yellow(),
            String::from_utf8_lossy(path)
        )?;
        Ok(())
    }

    fn dump_docket(&self, file_index: &FileIndex) -> anyhow::Result<()> {
        let docket = file_index.docket();
        let mut writer = self.writer();

        writeln!(writer, "marker: {}", String::from_utf8_lossy(FORMAT_MARKER))?;
        for kind in DataFileKind::ALL {
            let name = docket
                .data_file_path(kind)
                .unwrap_or_else(|| "unset".to_string());
            writeln!(
                writer,
                "{}: {} ({} bytes)",
                kind.prefix(),
                name.cyan(),
                docket.file_size(kind)
            )?;
        }
        writeln!(writer, "tree_root_pointer: {:08x}", docket.tree_root_pointer)?;
        writeln!(writer, "tree_unused_bytes: {}", docket.tree_unused_bytes)?;
        writeln!(writer, "garbage_entries: {}", docket.garbage_entries.len())?;
        for entry in &docket.garbage_entries {
            writeln!(
                writer,
                "    {} ttl={} timestamp={}",
                entry.path.red(),
                entry.ttl,
                entry.timestamp
            )?;
        }

        Ok(())
    }

    fn dump_tree(&self, file_index: &FileIndex) -> anyhow::Result<()> {
        let mut writer = self.writer();

        for node in file_index.debug_iter_tree_nodes() {
            let (pointer, token, children) = node?;
            let pointer = format!("{pointer:08x}");
            if token.is_root() {
                writeln!(writer, "{}:", pointer.yellow())?;
            } else {
                writeln!(writer, "{}: token = {}", pointer.yellow(), token)?;
            }

            for (_, label, child) in children {
                let label = String::from_utf8_lossy(label);
                match child {
                    ChildRef::Node(pointer) => {
                        writeln!(writer, "    \"{label}\" -> {pointer:08x}")?
                    }
                    ChildRef::Leaf(token) => {
                        writeln!(writer, "    \"{label}\" -> token = {token}")?
                    }
                }
            }
        }

        Ok(())
    }
}

/// Human-readable size, in bytes below 1 KiB
fn byte_count(size: u32) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if size < 1024 {
        return format!("{size} bytes");
    }
    let mut value = f64::from(size) / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}
