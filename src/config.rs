use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};




/**
 * Options for building a `ThreadPool`.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads. Must be at least one.
    pub num_threads: usize,

    /// Pin worker `i` to physical core `i % num_cores`.
    pub pin_to_cores: bool,

    /// Record the start and end time of every chunk the workers execute.
    pub record_map_log: bool,

    /// Prefix for the worker thread names.
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            pin_to_cores: false,
            record_map_log: false,
            thread_name: "mapdump-worker".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::InvalidConfig("num_threads must be at least 1".into()));
        }
        Ok(())
    }
}




/**
 * Options for creating an `AppendLog`.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Size in bytes of the file when it is first mapped.
    pub initial_capacity: usize,

    /// When `ensure` has to grow the mapping, the new capacity is
    /// `(used + additional) * growth_factor`, rounded up to the page size.
    pub growth_factor: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 1 << 20,
            growth_factor: 2,
        }
    }
}

impl LogConfig {
    pub fn with_capacity(initial_capacity: usize) -> Self {
        Self {
            initial_capacity,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.growth_factor == 0 {
            return Err(Error::InvalidConfig("growth_factor must be at least 1".into()));
        }
        Ok(())
    }
}
