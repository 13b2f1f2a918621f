// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the table builder.
///
/// `bucket_capacity` is the in-memory buffer per bucket in bytes. There
/// are 65,536 buckets, so pick a value such that `bucket_capacity * 65536`
/// fits in RAM; 196,600 uses about 12 GB. Thread counts must be powers of
/// two for the stride arithmetic to cover the state space exactly, and
/// `sort_threads` must divide 256. Reduce `sort_threads` if a network disk
/// cannot keep up with the concurrent reads and writes of the sort phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub thread_count: usize,
    pub sort_threads: usize,
    pub bucket_capacity: usize,
    pub root_dir: PathBuf,
    /// Register value the enumeration walk starts from.
    pub start_state: u64,
    /// Override for the number of states each builder thread emits.
    /// Defaults to 2^37 divided by `thread_count`.
    pub entries_per_thread: Option<u64>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            thread_count: 8,
            sort_threads: 8,
            bucket_capacity: 196_600,
            root_dir: PathBuf::from("."),
            start_state: 0x1234_5678_9abc,
            entries_per_thread: None,
        }
    }
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let cfg: BuildConfig = serde_json::from_str(&text).map_err(|e| Error::InputData {
            path: path.to_path_buf(),
            line: e.line(),
            detail: e.to_string(),
        })?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 || !self.thread_count.is_power_of_two() {
            return Err(Error::usage(
                "thread_count",
                format!("{} (must be a power of two)", self.thread_count),
            ));
        }
        if self.sort_threads == 0 || 256 % self.sort_threads != 0 {
            return Err(Error::usage(
                "sort_threads",
                format!("{} (must divide 256)", self.sort_threads),
            ));
        }
        if self.bucket_capacity < 10 {
            return Err(Error::usage(
                "bucket_capacity",
                format!("{} (smaller than one record)", self.bucket_capacity),
            ));
        }
        Ok(())
    }

    /// States each builder thread visits.
    pub fn entries_per_thread(&self) -> u64 {
        self.entries_per_thread
            .unwrap_or((1u64 << 37) / self.thread_count as u64)
    }
}
