//! Atomic file writes.
//!
//! Content is written to a temporary file in the target's directory and
//! renamed over the target. Readers observe either the old or the new file,
//! never a partial one. The temporary file is removed on every failure path
//! when the `NamedTempFile` is dropped.

use crate::errors::StoreError;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::{Builder, NamedTempFile};

/// Atomically replaces `path` with `data`, creating parent directories.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = write_temp(path, data)?;
    tmp.persist(path)
        .map_err(|e| StoreError::io("rename temp file over", path, e.error))?;
    Ok(())
}

/// Atomically creates `path` with `data`; fails with `AlreadyExists` if it exists.
///
/// Unlike `OpenOptions::create_new` followed by a write, the file only becomes
/// visible once its content is complete.
pub fn atomic_create(path: &Path, data: &[u8]) -> Result<bool, StoreError> {
    let tmp = write_temp(path, data)?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::io("create", path, e.error)),
    }
}

/// Reads a file, returning `None` if it does not exist.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io("read", path, e)),
    }
}

/// Removes a file; a missing file is not an error.
pub fn remove_optional(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io("remove", path, e)),
    }
}

fn write_temp(path: &Path, data: &[u8]) -> Result<NamedTempFile, StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| StoreError::io("create directory", dir, e))?;

    let prefix = format!(
        ".{}.",
        path.file_name()
            .map_or_else(|| "state".into(), |n| n.to_string_lossy())
    );
    let mut tmp = Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| StoreError::io("create temp file in", dir, e))?;

    tmp.write_all(data)
        .map_err(|e| StoreError::io("write temp file for", path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io("sync temp file for", path, e))?;
    Ok(tmp)
}
