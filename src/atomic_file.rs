//! Atomic file replacement
//!
//! Content goes to a temp file in the target's directory, is synced, then
//! renamed over the target. Readers see either the old file or the new one.

use crate::error::{Error, Result};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `path` with `contents`, creating parent directories as needed.
///
/// Any failure is reported as `Error::Persist` naming the target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    replace(path, contents).map_err(|e| Error::Persist(format!("{}: {}", path.display(), e)))
}

fn replace(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    // Same directory so the rename never crosses filesystems
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}
