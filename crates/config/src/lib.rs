//! # Config - Block Store Settings
//!
//! Settings shared by the transaction manager and everything layered on it.
//!
//! ## Environment
//!
//! ```text
//! PDATA_BLOCK_SIZE   Block size in bytes            (default: 4096)
//! PDATA_NR_BLOCKS    Device capacity in blocks      (default: 1048576)
//! PDATA_PATH         Backing file, unset = memory   (default: unset)
//! PDATA_SYNC         fsync the device on commit     (default: "true")
//! ```
//!
//! Unparsable values fall back to the default.

use std::path::PathBuf;

use thiserror::Error;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// Smallest block size accepted by [`StoreConfig::validate`].
pub const MIN_BLOCK_SIZE: usize = 512;
/// Largest block size accepted by [`StoreConfig::validate`].
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;
/// Default device capacity in blocks (4 GiB with 4 KiB blocks).
pub const DEFAULT_NR_BLOCKS: u64 = 1024 * 1024;

/// Errors reported by [`StoreConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("block size {0} must be a power of two between 512 and 1048576")]
    BlockSize(usize),

    #[error("device capacity must be at least one block")]
    Capacity,
}

/// Settings for opening a block store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Size of every block on the device, framing included.
    pub block_size: usize,
    /// Number of blocks the device may hold.
    pub nr_blocks: u64,
    /// Backing file. `None` keeps every block in memory.
    pub path: Option<PathBuf>,
    /// If `true`, every commit is followed by a device sync.
    pub sync_on_commit: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            nr_blocks: DEFAULT_NR_BLOCKS,
            path: None,
            sync_on_commit: true,
        }
    }
}

impl StoreConfig {
    /// An in-memory store with the given block size and capacity.
    pub fn in_memory(block_size: usize, nr_blocks: u64) -> Self {
        Self {
            block_size,
            nr_blocks,
            ..Self::default()
        }
    }

    /// Reads the `PDATA_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup, falling back to the
    /// defaults for missing or malformed entries.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).map(|v| v.trim().to_string());

        let block_size = parsed("PDATA_BLOCK_SIZE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.block_size);
        let nr_blocks = parsed("PDATA_NR_BLOCKS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.nr_blocks);
        let path = parsed("PDATA_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let sync_on_commit = parsed("PDATA_SYNC")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.sync_on_commit);

        Self {
            block_size,
            nr_blocks,
            path,
            sync_on_commit,
        }
    }

    /// Checks the block size and capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        if self.nr_blocks == 0 {
            return Err(ConfigError::Capacity);
        }
        Ok(())
    }
}
