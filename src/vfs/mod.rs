//! Virtual filesystem over the game's physical media
//!
//! Every media back-end exposes the same two capabilities:
//!
//! - [`Directory`]: ordered listing plus lookup of nested directories and files
//! - [`File`]: size plus lazily realized, memoized contents
//!
//! | Driver | Medium |
//! |--------|--------|
//! | [`dir::DirectoryDriver`] | Unpacked files on the host filesystem |
//! | [`iso::IsoDriver`] | ISO 9660 disc image |
//! | [`psarc::PsarcDriver`] | PS3 PSARC compressed archive |
//! | [`toc::TableOfContents`] | `GODOFWAR.TOC` index over pack files in another directory |
//!
//! Name lookups are case-insensitive.

pub mod dir;
pub mod handle;
pub mod iso;
pub mod psarc;
pub mod toc;
pub(crate) mod tree;

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::error::{Error, Result};

/// One row of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub name: String,
    pub is_dir: bool,
}

impl Entry {
    pub fn file(name: impl Into<String>) -> Self {
        Entry {
            name: name.into(),
            is_dir: false,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Entry {
            name: name.into(),
            is_dir: true,
        }
    }
}

/// A directory on some medium
pub trait Directory: Send + Sync {
    /// Entries in the medium's order
    fn list(&self) -> Result<Vec<Entry>>;

    /// Nested directory by name
    fn get_directory(&self, name: &str) -> Result<Arc<dyn Directory>>;

    /// File by name
    fn get_file(&self, name: &str) -> Result<Arc<dyn File>>;
}

/// A file on some medium
pub trait File: Send + Sync {
    fn name(&self) -> &str;

    /// Uncompressed size in bytes
    fn size(&self) -> u64;

    /// Full contents, read on first use and cached by the file
    fn data(&self) -> Result<Arc<[u8]>>;

    /// Fails once the medium behind the file has been closed
    fn ensure_open(&self) -> Result<()> {
        Ok(())
    }

    /// `len` bytes starting at `offset` within the file
    fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let data = self.data()?;
        let range = checked_range(offset, len, data.len() as u64)
            .ok_or_else(|| out_of_bounds(self.name(), offset, len, data.len() as u64))?;
        Ok(data[range].to_vec())
    }
}

/// Memoized file contents
#[derive(Default)]
pub(crate) struct DataCell(Mutex<Option<Arc<[u8]>>>);

impl DataCell {
    /// Return the cached bytes, loading them under the lock on first use
    pub(crate) fn get_or_load(&self, load: impl FnOnce() -> Result<Vec<u8>>) -> Result<Arc<[u8]>> {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(data) = slot.as_ref() {
            return Ok(data.clone());
        }
        let data: Arc<[u8]> = load()?.into();
        *slot = Some(data.clone());
        Ok(data)
    }
}

/// `offset..offset+len` if it lies within `size`
pub(crate) fn checked_range(offset: u64, len: u64, size: u64) -> Option<std::ops::Range<usize>> {
    let end = offset.checked_add(len)?;
    if end > size {
        return None;
    }
    Some(offset as usize..end as usize)
}

pub(crate) fn out_of_bounds(what: &str, offset: u64, len: u64, size: u64) -> Error {
    Error::Corrupt(format!(
        "{}: range {:#x}+{:#x} exceeds size {:#x}",
        what, offset, len, size
    ))
}

/// Resolve a `/`-separated path to a file
pub fn resolve_file(root: &dyn Directory, path: &str) -> Result<Arc<dyn File>> {
    let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let name = parts
        .pop()
        .ok_or_else(|| Error::NotFound(path.to_string()))?;

    let mut dir: Option<Arc<dyn Directory>> = None;
    for part in parts {
        let next = match &dir {
            Some(d) => d.get_directory(part)?,
            None => root.get_directory(part)?,
        };
        dir = Some(next);
    }

    match &dir {
        Some(d) => d.get_file(name),
        None => root.get_file(name),
    }
}

/// Every file path under `root`, `/`-joined
///
/// Directories that cannot be opened are skipped with a warning.
pub fn walk_files(root: &dyn Directory) -> Result<Vec<String>> {
    let mut out = Vec::new();
    walk_into(root, "", &mut out)?;
    Ok(out)
}

fn walk_into(dir: &dyn Directory, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    for entry in dir.list()? {
        let path = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", prefix, entry.name)
        };
        if entry.is_dir {
            match dir.get_directory(&entry.name) {
                Ok(sub) => walk_into(sub.as_ref(), &path, out)?,
                Err(e) => tracing::warn!("Skipping directory {}: {}", path, e),
            }
        } else {
            out.push(path);
        }
    }
    Ok(())
}
