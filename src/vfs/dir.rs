//! Plain host directory driver
//!
//! A passthrough to files unpacked on disk. Listings are sorted by name since
//! the host gives no stable order.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use super::{checked_range, out_of_bounds, DataCell, Directory, Entry, File};
use crate::error::{Error, Result};

pub struct DirectoryDriver {
    root: PathBuf,
}

impl DirectoryDriver {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::NotADirectory(root.display().to_string()));
        }
        Ok(DirectoryDriver { root })
    }

    /// Host path of `name`, matched case-insensitively against the listing
    fn child_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(Error::NotFound(name.to_string()));
        }
        let exact = self.root.join(name);
        if exact.exists() {
            return Ok(exact);
        }
        self.read_entries()?
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(n, _)| self.root.join(n))
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn read_entries(&self) -> Result<Vec<(String, bool)>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push((name, entry.file_type().is_dir()));
        }
        Ok(out)
    }
}

impl Directory for DirectoryDriver {
    fn list(&self) -> Result<Vec<Entry>> {
        Ok(self
            .read_entries()?
            .into_iter()
            .map(|(name, is_dir)| Entry { name, is_dir })
            .collect())
    }

    fn get_directory(&self, name: &str) -> Result<Arc<dyn Directory>> {
        let path = self.child_path(name)?;
        if !path.is_dir() {
            return Err(Error::NotADirectory(name.to_string()));
        }
        Ok(Arc::new(DirectoryDriver { root: path }))
    }

    fn get_file(&self, name: &str) -> Result<Arc<dyn File>> {
        let path = self.child_path(name)?;
        let meta = fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(Error::NotFound(format!("{} is not a file", name)));
        }
        Ok(Arc::new(HostFile {
            name: name.to_string(),
            path,
            size: meta.len(),
            cell: DataCell::default(),
        }))
    }
}

struct HostFile {
    name: String,
    path: PathBuf,
    size: u64,
    cell: DataCell,
}

impl File for HostFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn data(&self) -> Result<Arc<[u8]>> {
        self.cell.get_or_load(|| Ok(fs::read(&self.path)?))
    }

    fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if checked_range(offset, len, self.size).is_none() {
            return Err(out_of_bounds(&self.name, offset, len, self.size));
        }
        let mut file = fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}
