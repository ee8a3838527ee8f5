//! File index configuration
//!
//! Settings are read from the `[fileindex]` table of `.fidx/config.toml`:
//!
//! ```toml
//! [fileindex]
//! vacuum-mode = "auto"            # auto | never | always
//! max-unused-percentage = 50      # 1..=100
//! gc-retention-seconds = 86400
//! garbage-timestamp = 0           # fixed timestamp for new garbage entries
//! mmap = true                     # map data files instead of reading them
//! ```
//!
//! Every key is optional and falls back to [`Config::default`].

use crate::errors::FileIndexError;
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

/// Default value of `max-unused-percentage`
pub const DEFAULT_MAX_UNUSED_PERCENTAGE: u32 = 50;

/// Default value of `gc-retention-seconds` (one day)
pub const DEFAULT_GC_RETENTION_S: u32 = 24 * 60 * 60;

/// When a write should rebuild the tree file from scratch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VacuumMode {
    /// Vacuum once the unused ratio crosses [`Config::max_unused_ratio`]
    #[default]
    Auto,
    Never,
    Always,
}

/// How data files are brought into memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Memory-map the files
    #[default]
    Mmap,
    /// Read the files into owned buffers, for filesystems where mapping is unsafe
    Read,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub vacuum_mode: VacuumMode,
    /// Ratio of unused tree bytes, in `(0, 1]`, that triggers an automatic vacuum
    pub max_unused_ratio: f64,
    /// Seconds a garbage file is kept after its TTL runs out; zero deletes it
    /// as soon as the TTL reaches zero
    pub gc_retention_s: u32,
    /// Overrides the clock when stamping new garbage entries
    pub garbage_timestamp: Option<u32>,
    pub load_mode: LoadMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            vacuum_mode: VacuumMode::default(),
            max_unused_ratio: f64::from(DEFAULT_MAX_UNUSED_PERCENTAGE) / 100.0,
            gc_retention_s: DEFAULT_GC_RETENTION_S,
            garbage_timestamp: None,
            load_mode: LoadMode::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ConfigFile {
    #[serde(default)]
    fileindex: FileIndexSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FileIndexSection {
    vacuum_mode: Option<VacuumMode>,
    max_unused_percentage: Option<u32>,
    gc_retention_seconds: Option<u32>,
    garbage_timestamp: Option<u32>,
    mmap: Option<bool>,
}

impl Config {
    /// Rejects values that make no sense for the write path
    pub fn validate(&self) -> crate::errors::Result<()> {
        let ratio = self.max_unused_ratio;
        if ratio.is_nan() || ratio <= 0.0 || ratio > 1.0 {
            return Err(FileIndexError::programming(format!(
                "invalid max_unused_ratio {ratio}, must be in (0, 1]"
            )));
        }

        Ok(())
    }

    /// Load the configuration file, or the defaults if it doesn't exist
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Config::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        let section = file.fileindex;
        let mut config = Config::default();

        if let Some(mode) = section.vacuum_mode {
            config.vacuum_mode = mode;
        }
        match section.max_unused_percentage {
            Some(percentage) if (1..=100).contains(&percentage) => {
                config.max_unused_ratio = f64::from(percentage) / 100.0;
            }
            Some(percentage) => {
                tracing::warn!(
                    percentage,
                    fallback = DEFAULT_MAX_UNUSED_PERCENTAGE,
                    "invalid fileindex.max-unused-percentage (must be between 1 and 100)"
                );
            }
            None => {}
        }
        if let Some(seconds) = section.gc_retention_seconds {
            config.gc_retention_s = seconds;
        }
        config.garbage_timestamp = section.garbage_timestamp;
        if section.mmap == Some(false) {
            config.load_mode = LoadMode::Read;
        }

        Ok(config)
    }
}
