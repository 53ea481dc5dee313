//! PSARC (PlayStation archive) driver
//!
//! ## Layout (big-endian)
//!
//! - Header: magic `PSAR`, version, compression (`zlib`/`lzma`), TOC length,
//!   TOC entry size, entry count, block size, archive flags
//! - TOC entries: MD5 of the path, first block index, uncompressed length
//!   (40-bit), content offset (40-bit)
//! - Block length table: one 2/3/4-byte length per block, up to the TOC length
//!
//! Entry 0 is the manifest: newline-separated paths of entries 1..n. Each
//! entry's content is a run of blocks starting at its offset. A length of 0
//! marks a full raw block; a block as long as its output is stored raw;
//! anything shorter is compressed with the archive codec.

use std::io::Read;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use flate2::read::ZlibDecoder;
use tracing::debug;

use super::handle::ArchiveHandle;
use super::tree::{TreeBuilder, TreeDirectory};
use super::{DataCell, Directory, Entry, File};
use crate::error::{Error, Result};

pub const PSARC_MAGIC: [u8; 4] = *b"PSAR";

const HEADER_SIZE: usize = 32;
const MIN_ENTRY_SIZE: usize = 30;

/// Archive flag: manifest paths are absolute (leading `/`)
pub const FLAG_ABSOLUTE_PATHS: u32 = 0x2;

/// Per-block codec named in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zlib,
    Lzma,
}

impl Compression {
    fn from_tag(tag: &[u8]) -> Result<Self> {
        match tag {
            b"zlib" => Ok(Compression::Zlib),
            b"lzma" => Ok(Compression::Lzma),
            other => Err(Error::Format(format!(
                "unknown PSARC compression {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PsarcHeader {
    pub version: u32,
    pub compression: Compression,
    pub toc_length: u32,
    pub toc_entry_size: u32,
    pub entry_count: u32,
    pub block_size: u32,
    pub flags: u32,
}

/// One TOC row
#[derive(Debug, Clone)]
pub struct PsarcEntry {
    pub block_index: u32,
    pub uncompressed_length: u64,
    pub offset: u64,
    /// Sum of the stored block lengths
    pub compressed_length: u64,
}

struct Archive {
    handle: Arc<ArchiveHandle>,
    header: PsarcHeader,
    block_lengths: Vec<u32>,
}

impl Archive {
    fn block_count(&self, entry: &PsarcEntry) -> u64 {
        entry.uncompressed_length.div_ceil(self.header.block_size as u64)
    }

    fn stored_length(&self, zsize: u32) -> u64 {
        if zsize == 0 {
            self.header.block_size as u64
        } else {
            zsize as u64
        }
    }

    fn compressed_length(&self, entry: &PsarcEntry) -> Result<u64> {
        let mut total = 0u64;
        for k in 0..self.block_count(entry) {
            total += self.stored_length(self.block_length(entry, k)?);
        }
        Ok(total)
    }

    fn block_length(&self, entry: &PsarcEntry, k: u64) -> Result<u32> {
        let index = entry.block_index as u64 + k;
        self.block_lengths
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::corrupt(format!("block index {} beyond block table", index)))
    }

    /// Decompress every block of `entry` and check the total length
    fn extract(&self, entry: &PsarcEntry) -> Result<Vec<u8>> {
        let block_size = self.header.block_size as u64;
        // the header length is untrusted; grow with the blocks actually read
        let mut out = Vec::new();
        let mut cursor = entry.offset;

        for k in 0..self.block_count(entry) {
            let expected = (entry.uncompressed_length - k * block_size).min(block_size);
            let zsize = self.block_length(entry, k)?;
            let stored = self.stored_length(zsize);
            let raw = self.handle.read_at(cursor, stored)?;
            cursor += stored;

            if stored >= expected {
                out.extend_from_slice(&raw[..expected.min(raw.len() as u64) as usize]);
            } else {
                self.decompress_block(&raw, expected, &mut out)?;
            }
        }

        if out.len() as u64 != entry.uncompressed_length {
            return Err(Error::corrupt(format!(
                "entry at {:#x} decompressed to {} bytes, expected {}",
                entry.offset,
                out.len(),
                entry.uncompressed_length
            )));
        }
        Ok(out)
    }

    fn decompress_block(&self, data: &[u8], expected: u64, out: &mut Vec<u8>) -> Result<()> {
        match self.header.compression {
            Compression::Zlib => {
                let before = out.len();
                ZlibDecoder::new(data)
                    .take(expected)
                    .read_to_end(out)
                    .map_err(|e| Error::corrupt(format!("zlib block: {}", e)))?;
                if (out.len() - before) as u64 != expected {
                    return Err(Error::corrupt(format!(
                        "zlib block inflated to {} bytes, expected {}",
                        out.len() - before,
                        expected
                    )));
                }
                Ok(())
            }
            Compression::Lzma => Err(Error::UnsupportedCompression("lzma".to_string())),
        }
    }
}

pub struct PsarcDriver {
    root: Arc<TreeDirectory>,
    header: PsarcHeader,
    entries: Vec<(String, PsarcEntry)>,
}

impl PsarcDriver {
    pub fn new(handle: Arc<ArchiveHandle>) -> Result<Self> {
        if handle.len() < HEADER_SIZE as u64 {
            return Err(Error::Format("file too small for a PSARC header".into()));
        }
        let raw = handle.read_at(0, HEADER_SIZE as u64)?;
        if raw[0..4] != PSARC_MAGIC {
            return Err(Error::Format("bad PSARC magic".into()));
        }
        let header = PsarcHeader {
            version: BigEndian::read_u32(&raw[4..8]),
            compression: Compression::from_tag(&raw[8..12])?,
            toc_length: BigEndian::read_u32(&raw[12..16]),
            toc_entry_size: BigEndian::read_u32(&raw[16..20]),
            entry_count: BigEndian::read_u32(&raw[20..24]),
            block_size: BigEndian::read_u32(&raw[24..28]),
            flags: BigEndian::read_u32(&raw[28..32]),
        };
        if header.block_size == 0 || (header.toc_entry_size as usize) < MIN_ENTRY_SIZE {
            return Err(Error::corrupt("bad PSARC block or entry size"));
        }
        if header.entry_count == 0 {
            return Err(Error::corrupt("PSARC has no manifest entry"));
        }

        let toc = handle.read_at(0, header.toc_length as u64)?;
        let entries_end = HEADER_SIZE as u64
            + header.entry_count as u64 * header.toc_entry_size as u64;
        if entries_end > toc.len() as u64 {
            return Err(Error::corrupt("PSARC entry table overruns TOC"));
        }

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for i in 0..header.entry_count as usize {
            let row = &toc[HEADER_SIZE + i * header.toc_entry_size as usize..];
            entries.push(PsarcEntry {
                block_index: BigEndian::read_u32(&row[16..20]),
                uncompressed_length: BigEndian::read_uint(&row[20..25], 5),
                offset: BigEndian::read_uint(&row[25..30], 5),
                compressed_length: 0,
            });
        }

        let width = block_length_width(header.block_size);
        let block_lengths = toc[entries_end as usize..]
            .chunks_exact(width)
            .map(|c| BigEndian::read_uint(c, width) as u32)
            .collect();

        let archive = Arc::new(Archive {
            handle,
            header: header.clone(),
            block_lengths,
        });
        for entry in &mut entries {
            entry.compressed_length = archive.compressed_length(entry)?;
        }

        let manifest = archive.extract(&entries[0])?;
        let manifest = String::from_utf8_lossy(&manifest);
        let names: Vec<&str> = manifest
            .split('\n')
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty())
            .collect();
        if names.len() + 1 < entries.len() {
            return Err(Error::corrupt(format!(
                "manifest names {} files for {} entries",
                names.len(),
                entries.len() - 1
            )));
        }

        let mut builder = TreeBuilder::new();
        let mut files = Vec::with_capacity(entries.len() - 1);
        for (name, entry) in names.iter().zip(entries.into_iter().skip(1)) {
            let path = if header.flags & FLAG_ABSOLUTE_PATHS != 0 {
                name.trim_start_matches('/')
            } else {
                name
            };
            let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
            let file = PsarcFile {
                name: file_name,
                archive: archive.clone(),
                entry: entry.clone(),
                cell: DataCell::default(),
            };
            if builder.insert_path(path, Arc::new(file)) {
                files.push((path.to_string(), entry));
            }
        }

        debug!(
            "PSARC v{}.{}: {} entries, block size {}, {:?}",
            header.version >> 16,
            header.version & 0xffff,
            header.entry_count,
            header.block_size,
            header.compression
        );

        Ok(PsarcDriver {
            root: builder.build(),
            header,
            entries: files,
        })
    }

    pub fn header(&self) -> &PsarcHeader {
        &self.header
    }

    /// Paths and TOC rows of every file, manifest excluded
    pub fn entries(&self) -> &[(String, PsarcEntry)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Directory for PsarcDriver {
    fn list(&self) -> Result<Vec<Entry>> {
        self.root.list()
    }

    fn get_directory(&self, name: &str) -> Result<Arc<dyn Directory>> {
        self.root.get_directory(name)
    }

    fn get_file(&self, name: &str) -> Result<Arc<dyn File>> {
        self.root.get_file(name)
    }
}

/// Bytes per block length: 2 up to 64 KiB blocks, 3 up to 16 MiB, else 4
fn block_length_width(block_size: u32) -> usize {
    if block_size <= 0x1_0000 {
        2
    } else if block_size <= 0x100_0000 {
        3
    } else {
        4
    }
}

struct PsarcFile {
    name: String,
    archive: Arc<Archive>,
    entry: PsarcEntry,
    cell: DataCell,
}

impl File for PsarcFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.entry.uncompressed_length
    }

    fn ensure_open(&self) -> Result<()> {
        self.archive.handle.ensure_open()
    }

    fn data(&self) -> Result<Arc<[u8]>> {
        self.archive.handle.ensure_open()?;
        self.cell.get_or_load(|| self.archive.extract(&self.entry))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use flate2::write::ZlibEncoder;
    use std::io::{Cursor, Write};

    const BLOCK: usize = 1024;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), flate2::Compression::best());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    /// Stored bytes and block lengths for one entry
    fn encode(data: &[u8], compress: bool) -> (Vec<u8>, Vec<u16>) {
        let mut stored = Vec::new();
        let mut lengths = Vec::new();
        for chunk in data.chunks(BLOCK) {
            let packed = zlib(chunk);
            if compress && packed.len() < chunk.len() {
                lengths.push(packed.len() as u16);
                stored.extend(packed);
            } else {
                lengths.push(if chunk.len() == BLOCK { 0 } else { chunk.len() as u16 });
                stored.extend_from_slice(chunk);
            }
        }
        (stored, lengths)
    }

    pub(crate) fn build_psarc(files: &[(&str, Vec<u8>, bool)]) -> Vec<u8> {
        let manifest = files.iter().map(|f| f.0).collect::<Vec<_>>().join("\n");
        let mut all = vec![(manifest.into_bytes(), true)];
        all.extend(files.iter().map(|(_, d, c)| (d.clone(), *c)));

        let encoded: Vec<_> = all.iter().map(|(d, c)| encode(d, *c)).collect();
        let block_total: usize = encoded.iter().map(|e| e.1.len()).sum();
        let toc_length = HEADER_SIZE + all.len() * 30 + block_total * 2;

        let mut out = Vec::new();
        out.extend_from_slice(b"PSAR");
        out.write_u32::<BigEndian>(0x0001_0004).unwrap();
        out.extend_from_slice(b"zlib");
        out.write_u32::<BigEndian>(toc_length as u32).unwrap();
        out.write_u32::<BigEndian>(30).unwrap();
        out.write_u32::<BigEndian>(all.len() as u32).unwrap();
        out.write_u32::<BigEndian>(BLOCK as u32).unwrap();
        out.write_u32::<BigEndian>(FLAG_ABSOLUTE_PATHS).unwrap();

        let mut offset = toc_length as u64;
        let mut block_index = 0u32;
        for ((data, _), (stored, lengths)) in all.iter().zip(&encoded) {
            out.extend_from_slice(&[0u8; 16]);
            out.write_u32::<BigEndian>(block_index).unwrap();
            out.write_uint::<BigEndian>(data.len() as u64, 5).unwrap();
            out.write_uint::<BigEndian>(offset, 5).unwrap();
            block_index += lengths.len() as u32;
            offset += stored.len() as u64;
        }
        for (_, lengths) in &encoded {
            for len in lengths {
                out.write_u16::<BigEndian>(*len).unwrap();
            }
        }
        assert_eq!(out.len(), toc_length);
        for (stored, _) in &encoded {
            out.extend_from_slice(stored);
        }
        out
    }

    fn open(bytes: Vec<u8>) -> (Arc<ArchiveHandle>, PsarcDriver) {
        let handle = Arc::new(ArchiveHandle::new(Cursor::new(bytes)).unwrap());
        let driver = PsarcDriver::new(handle.clone()).unwrap();
        (handle, driver)
    }

    fn sample() -> Vec<u8> {
        // compressible first block, incompressible middle block, short tail
        let mut big: Vec<u8> = b"GOW3 ".iter().cycle().take(BLOCK).copied().collect();
        let mut state = 0x1234_5678u32;
        for _ in 0..BLOCK {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            big.push((state >> 16) as u8);
        }
        big.extend(std::iter::repeat(b'z').take(452));
        big
    }

    #[test]
    fn test_stored_entry_matches_reference() {
        let reference = b"raw wad bytes".to_vec();
        let (_, psarc) = open(build_psarc(&[("/LEVELS/ARENA.WAD", reference.clone(), false)]));
        assert_eq!(psarc.len(), 1);
        assert_eq!(psarc.list().unwrap(), vec![Entry::dir("LEVELS")]);

        let file = psarc.get_directory("LEVELS").unwrap().get_file("ARENA.WAD").unwrap();
        assert_eq!(file.size(), reference.len() as u64);
        assert_eq!(&*file.data().unwrap(), &reference[..]);
    }

    #[test]
    fn test_blockwise_compressed_entry() {
        let big = sample();
        let (_, psarc) = open(build_psarc(&[
            ("/A.BIN", big.clone(), true),
            ("/B.TXT", b"tail".to_vec(), true),
        ]));
        assert_eq!(
            psarc.list().unwrap(),
            vec![Entry::file("A.BIN"), Entry::file("B.TXT")]
        );

        let a = psarc.get_file("a.bin").unwrap();
        let data = a.data().unwrap();
        assert_eq!(data.len() as u64, a.size());
        assert_eq!(&*data, &big[..]);
        assert_eq!(&*psarc.get_file("B.TXT").unwrap().data().unwrap(), b"tail");
    }

    #[test]
    fn test_entry_lengths_recorded() {
        let big = sample();
        let (_, psarc) = open(build_psarc(&[("/A.BIN", big.clone(), true)]));
        let (path, entry) = &psarc.entries()[0];
        assert_eq!(path, "A.BIN");
        assert_eq!(entry.uncompressed_length, big.len() as u64);
        assert_eq!(entry.block_index, 1);
        assert!(entry.compressed_length < big.len() as u64);
    }

    #[test]
    fn test_bad_magic_and_closed_handle() {
        let mut bytes = build_psarc(&[("/A", b"a".to_vec(), false)]);
        bytes[0] = b'X';
        let handle = Arc::new(ArchiveHandle::new(Cursor::new(bytes)).unwrap());
        assert!(matches!(PsarcDriver::new(handle), Err(Error::Format(_))));

        let (handle, psarc) = open(build_psarc(&[("/A", b"a".to_vec(), false)]));
        let file = psarc.get_file("A").unwrap();
        handle.close();
        assert!(matches!(file.data(), Err(Error::Closed)));
    }

    #[test]
    fn test_relative_manifest_paths_skipped() {
        let (_, psarc) = open(build_psarc(&[
            ("/../../ESCAPE.TXT", b"out".to_vec(), false),
            ("/SAFE.TXT", b"in".to_vec(), false),
        ]));
        assert_eq!(psarc.list().unwrap(), vec![Entry::file("SAFE.TXT")]);
        assert_eq!(psarc.len(), 1);
        assert_eq!(psarc.entries()[0].0, "SAFE.TXT");
        assert!(matches!(psarc.get_directory(".."), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_oversized_entry_length_is_corrupt() {
        // 4-byte block lengths; 257 one-byte blocks claim 1 TiB
        let blocks = 257usize;
        let toc_length = HEADER_SIZE + 2 * 30 + (1 + blocks) * 4;
        let mut out = Vec::new();
        out.extend_from_slice(b"PSAR");
        out.write_u32::<BigEndian>(0x0001_0004).unwrap();
        out.extend_from_slice(b"zlib");
        out.write_u32::<BigEndian>(toc_length as u32).unwrap();
        out.write_u32::<BigEndian>(30).unwrap();
        out.write_u32::<BigEndian>(2).unwrap();
        out.write_u32::<BigEndian>(u32::MAX).unwrap();
        out.write_u32::<BigEndian>(0).unwrap();

        out.extend_from_slice(&[0u8; 16]);
        out.write_u32::<BigEndian>(0).unwrap();
        out.write_uint::<BigEndian>(1, 5).unwrap();
        out.write_uint::<BigEndian>(toc_length as u64, 5).unwrap();

        out.extend_from_slice(&[0u8; 16]);
        out.write_u32::<BigEndian>(1).unwrap();
        out.write_uint::<BigEndian>(0xFF_FFFF_FFFF, 5).unwrap();
        out.write_uint::<BigEndian>(toc_length as u64 + 1, 5).unwrap();

        for _ in 0..=blocks {
            out.write_u32::<BigEndian>(1).unwrap();
        }
        assert_eq!(out.len(), toc_length);
        out.push(b'A');
        out.extend(std::iter::repeat(0u8).take(blocks));

        let (_, psarc) = open(out);
        let file = psarc.get_file("A").unwrap();
        assert_eq!(file.size(), 0xFF_FFFF_FFFF);
        assert!(matches!(file.data(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_truncated_content_is_corrupt() {
        let mut bytes = build_psarc(&[("/A.BIN", vec![7u8; 300], false)]);
        bytes.truncate(bytes.len() - 10);
        let (_, psarc) = open(bytes);
        let err = psarc.get_file("A.BIN").unwrap().data().unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
