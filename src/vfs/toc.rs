//! `GODOFWAR.TOC` driver
//!
//! The disc keeps game files inside large pack spans (`PART1.PAK`,
//! `PART2.PAK`, ...). The TOC maps each logical name to a span and a byte
//! range within it. This driver wraps the directory holding the TOC and the
//! spans and exposes one flat directory of logical files.
//!
//! ## Record layout (little-endian, 36 bytes)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0  | 24 | name, NUL padded |
//! | 24 | 4  | span index (0 = `PART1.PAK`) |
//! | 28 | 4  | start sector (2048 bytes) |
//! | 32 | 4  | size in bytes |

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::{debug, warn};

use super::{DataCell, Directory, Entry, File};
use crate::error::{Error, Result};

pub const TOC_FILE_NAME: &str = "GODOFWAR.TOC";
pub const TOC_RECORD_SIZE: usize = 36;
pub const TOC_SECTOR_SIZE: u64 = 2048;

const NAME_SIZE: usize = 24;

/// One TOC record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub name: String,
    pub span: u32,
    pub offset: u64,
    pub size: u64,
}

/// Pack span file name for a span index
pub fn span_name(span: u32) -> String {
    format!("PART{}.PAK", span + 1)
}

/// Parse the raw TOC into records, in file order
pub fn parse_toc(data: &[u8]) -> Result<Vec<TocEntry>> {
    if data.len() % TOC_RECORD_SIZE != 0 {
        return Err(Error::corrupt(format!(
            "TOC length {} is not a multiple of {}",
            data.len(),
            TOC_RECORD_SIZE
        )));
    }
    let mut cursor = Cursor::new(data);
    let mut entries = Vec::with_capacity(data.len() / TOC_RECORD_SIZE);
    for _ in 0..data.len() / TOC_RECORD_SIZE {
        let mut name = [0u8; NAME_SIZE];
        std::io::Read::read_exact(&mut cursor, &mut name)?;
        let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        let span = cursor.read_u32::<LittleEndian>()?;
        let sector = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u32::<LittleEndian>()?;
        if end == 0 {
            continue;
        }
        entries.push(TocEntry {
            name: String::from_utf8_lossy(&name[..end]).into_owned(),
            span,
            offset: sector as u64 * TOC_SECTOR_SIZE,
            size: size as u64,
        });
    }
    Ok(entries)
}

pub struct TableOfContents {
    entries: Vec<TocEntry>,
    /// One file per entry, shared by every lookup
    files: Vec<Arc<TocFile>>,
    index: HashMap<String, usize>,
}

impl TableOfContents {
    /// Read `GODOFWAR.TOC` from `inner` and index its records
    pub fn new(inner: Arc<dyn Directory>) -> Result<Self> {
        let toc = inner.get_file(TOC_FILE_NAME).map_err(|e| match e {
            Error::NotFound(_) => Error::Format(format!("{} not found", TOC_FILE_NAME)),
            other => other,
        })?;
        let records = parse_toc(&toc.data()?)?;

        let mut entries = Vec::with_capacity(records.len());
        let mut index = HashMap::with_capacity(records.len());
        let mut span_sizes: HashMap<u32, Option<u64>> = HashMap::new();
        for record in records {
            let key = record.name.to_ascii_lowercase();
            // later copies of a name live on other layers of the disc
            if index.contains_key(&key) {
                continue;
            }
            let span_size = *span_sizes
                .entry(record.span)
                .or_insert_with(|| inner.get_file(&span_name(record.span)).ok().map(|f| f.size()));
            match span_size {
                Some(size) if record.offset + record.size > size => warn!(
                    "{} lies outside {} ({:#x}+{:#x} > {:#x})",
                    record.name,
                    span_name(record.span),
                    record.offset,
                    record.size,
                    size
                ),
                None => warn!("{} refers to missing {}", record.name, span_name(record.span)),
                _ => {}
            }
            index.insert(key, entries.len());
            entries.push(record);
        }

        let files = entries
            .iter()
            .map(|entry| {
                Arc::new(TocFile {
                    entry: entry.clone(),
                    inner: inner.clone(),
                    cell: DataCell::default(),
                })
            })
            .collect();

        debug!("TOC: {} files over {} spans", entries.len(), span_sizes.len());
        Ok(TableOfContents {
            entries,
            files,
            index,
        })
    }

    pub fn entries(&self) -> &[TocEntry] {
        &self.entries
    }
}

impl Directory for TableOfContents {
    fn list(&self) -> Result<Vec<Entry>> {
        Ok(self
            .entries
            .iter()
            .map(|e| Entry::file(e.name.clone()))
            .collect())
    }

    fn get_directory(&self, name: &str) -> Result<Arc<dyn Directory>> {
        if self.index.contains_key(&name.to_ascii_lowercase()) {
            Err(Error::NotADirectory(name.to_string()))
        } else {
            Err(Error::NotFound(name.to_string()))
        }
    }

    fn get_file(&self, name: &str) -> Result<Arc<dyn File>> {
        let &i = self
            .index
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(self.files[i].clone())
    }
}

/// Logical file resolved by a ranged read on its span
struct TocFile {
    entry: TocEntry,
    inner: Arc<dyn Directory>,
    cell: DataCell,
}

impl TocFile {
    fn span(&self) -> Result<Arc<dyn File>> {
        self.inner.get_file(&span_name(self.entry.span))
    }
}

impl File for TocFile {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn size(&self) -> u64 {
        self.entry.size
    }

    fn ensure_open(&self) -> Result<()> {
        self.span()?.ensure_open()
    }

    fn data(&self) -> Result<Arc<[u8]>> {
        let span = self.span()?;
        span.ensure_open()?;
        self.cell
            .get_or_load(|| span.read_range(self.entry.offset, self.entry.size))
    }

    fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if super::checked_range(offset, len, self.entry.size).is_none() {
            return Err(super::out_of_bounds(&self.entry.name, offset, len, self.entry.size));
        }
        self.span()?.read_range(self.entry.offset + offset, len)
    }
}
