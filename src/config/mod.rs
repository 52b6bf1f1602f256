use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_MAX_ROWS_PER_BLOCK: usize = 4096;

/// What a scan shows when two rows of a table carry the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    /// Only the most recently inserted row for a timestamp is visible.
    #[default]
    Overwrite,
    /// Every row is visible; equal timestamps come out in insertion order.
    KeepAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_rows_per_block: usize,
    /// Flush a table's write buffer once an insert leaves it with at least
    /// this many rows. `None` leaves flushing to the caller.
    pub flush_threshold_rows: Option<usize>,
    pub duplicate_policy: DuplicatePolicy,
    pub sync_wal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_rows_per_block: DEFAULT_MAX_ROWS_PER_BLOCK,
            flush_threshold_rows: None,
            duplicate_policy: DuplicatePolicy::default(),
            sync_wal: true,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_max_rows_per_block(mut self, rows: usize) -> Self {
        self.max_rows_per_block = rows;
        self
    }

    #[must_use]
    pub fn with_flush_threshold_rows(mut self, rows: Option<usize>) -> Self {
        self.flush_threshold_rows = rows;
        self
    }

    #[must_use]
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    #[must_use]
    pub fn with_sync_wal(mut self, sync: bool) -> Self {
        self.sync_wal = sync;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_rows_per_block == 0 {
            return Err(Error::invalid("max_rows_per_block must be positive"));
        }
        if self.flush_threshold_rows == Some(0) {
            return Err(Error::invalid("flush_threshold_rows must be positive"));
        }
        Ok(())
    }

    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
