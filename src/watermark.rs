//! Durable per-class watermarks
//!
//! Each watermark is a single integer in its own file, written atomically.
//! Exactly one component owns (and writes) each watermark.

use crate::atomic_file::write_atomic;
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Highest store id already accounted for by one scanner
pub struct Watermark {
    path: PathBuf,
    value: Option<i64>,
}

impl Watermark {
    /// Load `<dir>/<name>.txt`; a missing or unreadable file leaves it unset
    pub fn load(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(format!("{}.txt", name));
        let value = if path.exists() {
            fs::read_to_string(&path)?.trim().parse().ok()
        } else {
            None
        };
        Ok(Self { path, value })
    }

    pub fn get(&self) -> Option<i64> {
        self.value
    }

    /// Current value, 0 if never initialized
    pub fn current(&self) -> i64 {
        self.value.unwrap_or(0)
    }

    pub fn is_initialized(&self) -> bool {
        self.value.is_some()
    }

    /// Move forward to `id`; lower values are ignored. Returns true if it moved.
    pub fn advance(&mut self, id: i64) -> bool {
        match self.value {
            Some(v) if v >= id => false,
            _ => {
                self.value = Some(id);
                true
            }
        }
    }

    /// Explicit reset, the only way the watermark may move backwards
    pub fn reset(&mut self, id: i64) {
        self.value = Some(id);
    }

    /// Write the current value atomically
    pub fn persist(&self) -> Result<()> {
        let value = match self.value {
            Some(v) => v,
            None => return Ok(()),
        };

        write_atomic(&self.path, value.to_string().as_bytes())
    }
}
