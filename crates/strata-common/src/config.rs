//! Configuration types for strata
//!
//! A store is described once at format time (name, block size, block count,
//! journal frequency); the remaining fields tune how it is mounted.

use crate::error::{Error, Result};
use crate::types::JournalMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest supported block size
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest supported block size
pub const MAX_BLOCK_SIZE: u32 = 4096;

/// Longest database name, in bytes
pub const MAX_NAME_LEN: usize = 63;

/// Check a block size: a multiple of 512 between 512 and 4096
#[must_use]
pub const fn is_valid_block_size(size: u32) -> bool {
    size % MIN_BLOCK_SIZE == 0 && size >= MIN_BLOCK_SIZE && size <= MAX_BLOCK_SIZE
}

/// Storage configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Name written into the header at format time
    pub database_name: String,
    /// Block size in bytes
    pub block_size: u32,
    /// Number of addressable blocks, header included
    pub block_count: u64,
    /// Distance between journal sectors, in allocation groups (0 = one sector)
    pub journal_frequency: u32,
    /// Durability strategy for executed operations
    pub journal_mode: JournalMode,
    /// Blocks requested each time an operation outgrows its reservation
    pub dynamic_top_up: u32,
    /// Use direct I/O (O_DIRECT on Linux) for file-backed stores
    pub direct_io: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_name: "strata".to_string(),
            block_size: 4096,
            block_count: 1 << 20,
            journal_frequency: 16,
            journal_mode: JournalMode::Safe,
            dynamic_top_up: 5,
            direct_io: false,
        }
    }
}

impl StorageConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if !is_valid_block_size(self.block_size) {
            return Err(Error::Configuration(format!(
                "block size {} must be a multiple of {MIN_BLOCK_SIZE} between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if self.database_name.is_empty() || self.database_name.len() > MAX_NAME_LEN {
            return Err(Error::Configuration(format!(
                "database name must be 1..={MAX_NAME_LEN} bytes"
            )));
        }
        // header, super block, first bitmap, first journal sector
        if self.block_count < 4 {
            return Err(Error::Configuration(format!(
                "block count {} is too small",
                self.block_count
            )));
        }
        if self.dynamic_top_up == 0 {
            return Err(Error::Configuration(
                "dynamic top-up must request at least one block".into(),
            ));
        }
        Ok(())
    }
}
