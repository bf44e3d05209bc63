use serde::{Deserialize, Serialize};

use crate::value::RuntimeError;

/// Resource ceilings for one stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Statements, loop iterations and calls a single run may perform.
    pub max_operations: u64,
    /// Longest list, tuple or dict a run may build.
    pub max_collection_len: usize,
    /// Longest string a run may build, in bytes.
    pub max_string_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_operations: 100_000,
            max_collection_len: 100_000,
            max_string_len: 1_000_000,
        }
    }
}

impl Limits {
    pub fn check_collection(&self, len: usize) -> Result<(), RuntimeError> {
        if len > self.max_collection_len {
            return Err(RuntimeError::limit(format!(
                "collection of {} items exceeds the limit of {}",
                len, self.max_collection_len
            )));
        }
        Ok(())
    }

    pub fn check_string(&self, len: usize) -> Result<(), RuntimeError> {
        if len > self.max_string_len {
            return Err(RuntimeError::limit(format!(
                "string of {} bytes exceeds the limit of {}",
                len, self.max_string_len
            )));
        }
        Ok(())
    }
}
