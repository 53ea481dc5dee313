//! Closable positioned-read source for archive media
//!
//! Image and archive drivers share one handle. Every read carries its own
//! offset and length; the seek+read pair runs under the handle's lock, so
//! concurrent readers never observe each other's cursor.

use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, PoisonError};

use super::{checked_range, out_of_bounds, DataCell, File};
use crate::error::{Error, Result};

trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Shared reader over an archive file (or any `Read + Seek` source)
pub struct ArchiveHandle {
    reader: Mutex<Option<Box<dyn ReadSeek>>>,
    len: u64,
}

impl ArchiveHandle {
    pub fn new<R: Read + Seek + Send + 'static>(mut reader: R) -> Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        Ok(ArchiveHandle {
            reader: Mutex::new(Some(Box::new(reader))),
            len,
        })
    }

    /// Total length of the medium
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read exactly `len` bytes at `offset`
    pub fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if checked_range(offset, len, self.len).is_none() {
            return Err(out_of_bounds("archive", offset, len, self.len));
        }
        let mut guard = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        let reader = guard.as_mut().ok_or(Error::Closed)?;
        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Drop the underlying reader
    pub fn close(&self) {
        let mut guard = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }

    pub fn is_open(&self) -> bool {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }
}

/// A file stored contiguously in an archive handle
pub(crate) struct ExtentFile {
    name: String,
    handle: Arc<ArchiveHandle>,
    offset: u64,
    size: u64,
    cell: DataCell,
}

impl ExtentFile {
    pub(crate) fn new(name: String, handle: Arc<ArchiveHandle>, offset: u64, size: u64) -> Self {
        ExtentFile {
            name,
            handle,
            offset,
            size,
            cell: DataCell::default(),
        }
    }
}

impl File for ExtentFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn ensure_open(&self) -> Result<()> {
        self.handle.ensure_open()
    }

    fn data(&self) -> Result<Arc<[u8]>> {
        self.handle.ensure_open()?;
        self.cell
            .get_or_load(|| self.handle.read_at(self.offset, self.size))
    }

    fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if checked_range(offset, len, self.size).is_none() {
            return Err(out_of_bounds(&self.name, offset, len, self.size));
        }
        self.handle.read_at(self.offset + offset, len)
    }
}
