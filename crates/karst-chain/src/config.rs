//! Blockchain configuration.

use std::path::PathBuf;
use std::time::Duration;

use karst_core::constants::{DEFAULT_BATCH_TIMEOUT_MS, DEFAULT_CLEARANCE_LEVEL};

/// Configuration for a [`Blockchain`](crate::chain::Blockchain) instance.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Root directory for persistent data.
    pub data_dir: PathBuf,
    /// Accepted-block count that forces an immediate organize+validate pass.
    pub clearance_level: u64,
    /// Deadline for a pending batch below the clearance level.
    pub batch_timeout: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("karst"),
            clearance_level: DEFAULT_CLEARANCE_LEVEL,
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
        }
    }
}

impl ChainConfig {
    /// Path to the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata.sqlite3")
    }
}
