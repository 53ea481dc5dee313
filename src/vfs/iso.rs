//! ISO 9660 disc image driver
//!
//! ## Layout
//!
//! - Sector 16: primary volume descriptor (type 1, `CD001`, version 1)
//! - Type-L path table: one record per directory, parents before children
//! - Each directory extent: variable-length directory records, never
//!   crossing a sector boundary (zero bytes pad the rest of a sector)
//!
//! The whole tree is built at construction; file contents are read on demand.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use super::handle::{ArchiveHandle, ExtentFile};
use super::tree::{TreeBuilder, TreeDirectory};
use super::{Directory, Entry, File};
use crate::error::{Error, Result};

/// Sector size used to locate the volume descriptor
pub const SECTOR_SIZE: u64 = 2048;

/// First volume descriptor sector
pub const VOLUME_DESCRIPTOR_SECTOR: u64 = 16;

const DIRECTORY_RECORD_MIN: usize = 33;
const FLAG_DIRECTORY: u8 = 0x02;

struct PathTableRecord {
    extent: u32,
    parent: u16,
    name: String,
}

struct DirectoryRecord {
    extent: u32,
    data_length: u32,
    is_dir: bool,
    name: String,
}

pub struct IsoDriver {
    root: Arc<TreeDirectory>,
    volume_id: String,
    block_size: u64,
}

impl IsoDriver {
    pub fn new(handle: Arc<ArchiveHandle>) -> Result<Self> {
        let pvd = handle
            .read_at(VOLUME_DESCRIPTOR_SECTOR * SECTOR_SIZE, SECTOR_SIZE)
            .map_err(|e| match e {
                Error::Corrupt(_) => Error::Format("image too small for a volume descriptor".into()),
                other => other,
            })?;

        if pvd[0] != 1 || &pvd[1..6] != b"CD001" {
            return Err(Error::Format("missing ISO 9660 primary volume descriptor".into()));
        }
        if pvd[6] != 1 {
            return Err(Error::Format(format!("unsupported volume descriptor version {}", pvd[6])));
        }

        let volume_id = String::from_utf8_lossy(&pvd[40..72]).trim_end().to_string();
        let block_size = LittleEndian::read_u16(&pvd[128..130]) as u64;
        if !block_size.is_power_of_two() || !(512..=SECTOR_SIZE).contains(&block_size) {
            return Err(Error::Format(format!("unsupported logical block size {}", block_size)));
        }
        let path_table_size = LittleEndian::read_u32(&pvd[132..136]) as u64;
        let path_table_lba = LittleEndian::read_u32(&pvd[140..144]) as u64;

        let table = handle.read_at(path_table_lba * block_size, path_table_size)?;
        let path_table = parse_path_table(&table)?;
        if path_table.is_empty() {
            return Err(Error::corrupt("path table has no root directory"));
        }

        let mut builder = TreeBuilder::new();
        // tree node for each path table entry, filled as parents are scanned
        let mut tree_ids: Vec<Option<usize>> = vec![None; path_table.len()];
        tree_ids[0] = Some(TreeBuilder::ROOT);
        let mut extent_to_tree = std::collections::HashMap::new();

        for (i, dir) in path_table.iter().enumerate() {
            let tree_id = match tree_ids[i].or_else(|| extent_to_tree.get(&dir.extent).copied()) {
                Some(id) => Some(id),
                None => {
                    let parent = (dir.parent as usize)
                        .checked_sub(1)
                        .filter(|&p| p < i)
                        .ok_or_else(|| {
                            Error::corrupt(format!("path table parent {} out of order", dir.parent))
                        })?;
                    // a refused parent takes its subtree with it
                    tree_ids[parent].and_then(|p| builder.add_dir(p, &dir.name))
                }
            };
            let Some(tree_id) = tree_id else {
                continue;
            };
            tree_ids[i] = Some(tree_id);

            for record in read_directory(&handle, dir.extent as u64, block_size)? {
                if record.is_dir {
                    if let Some(sub) = builder.add_dir(tree_id, &record.name) {
                        extent_to_tree.insert(record.extent, sub);
                    }
                } else {
                    let file = ExtentFile::new(
                        record.name.clone(),
                        handle.clone(),
                        record.extent as u64 * block_size,
                        record.data_length as u64,
                    );
                    builder.add_file(tree_id, &record.name, Arc::new(file));
                }
            }
        }

        debug!(
            "ISO volume '{}': {} directories, block size {}",
            volume_id,
            path_table.len(),
            block_size
        );

        Ok(IsoDriver {
            root: builder.build(),
            volume_id,
            block_size,
        })
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }
}

impl Directory for IsoDriver {
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

fn parse_path_table(data: &[u8]) -> Result<Vec<PathTableRecord>> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let len_di = data[pos] as usize;
        if len_di == 0 {
            break;
        }
        let end = pos + 8 + len_di;
        if end > data.len() {
            return Err(Error::corrupt("truncated path table record"));
        }
        let extent = LittleEndian::read_u32(&data[pos + 2..pos + 6]);
        let parent = LittleEndian::read_u16(&data[pos + 6..pos + 8]);
        let name = clean_name(&data[pos + 8..end]);
        records.push(PathTableRecord {
            extent,
            parent,
            name,
        });
        pos = end + (len_di & 1);
    }
    Ok(records)
}

fn read_directory(
    handle: &ArchiveHandle,
    extent: u64,
    block_size: u64,
) -> Result<Vec<DirectoryRecord>> {
    // the "." record at the start of the extent carries the extent's length
    let first = handle.read_at(extent * block_size, block_size)?;
    if (first[0] as usize) < DIRECTORY_RECORD_MIN {
        return Err(Error::corrupt(format!("bad self record in extent {}", extent)));
    }
    let length = LittleEndian::read_u32(&first[10..14]) as u64;
    let data = if length > block_size {
        handle.read_at(extent * block_size, length)?
    } else {
        first
    };

    let limit = (length as usize).min(data.len());
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < limit {
        let len = data[pos] as usize;
        if len == 0 {
            pos = (pos / block_size as usize + 1) * block_size as usize;
            continue;
        }
        if len < DIRECTORY_RECORD_MIN || pos + len > data.len() {
            return Err(Error::corrupt(format!(
                "bad directory record at {:#x} in extent {}",
                pos, extent
            )));
        }
        let rec = &data[pos..pos + len];
        let name_len = rec[32] as usize;
        if DIRECTORY_RECORD_MIN + name_len > len {
            return Err(Error::corrupt("directory record name overruns record"));
        }
        let ident = &rec[33..33 + name_len];
        pos += len;

        // "." and ".."
        if name_len == 1 && (ident[0] == 0 || ident[0] == 1) {
            continue;
        }
        records.push(DirectoryRecord {
            extent: LittleEndian::read_u32(&rec[2..6]),
            data_length: LittleEndian::read_u32(&rec[10..14]),
            is_dir: rec[25] & FLAG_DIRECTORY != 0,
            name: clean_name(ident),
        });
    }
    Ok(records)
}

/// Strip the `;1` version suffix and a bare trailing dot
fn clean_name(ident: &[u8]) -> String {
    let name = String::from_utf8_lossy(ident);
    let name = name.split(';').next().unwrap_or_default();
    name.strip_suffix('.').unwrap_or(name).to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::{BigEndian, WriteBytesExt};
    use std::io::Cursor;

    const BS: usize = SECTOR_SIZE as usize;

    fn dir_record(extent: u32, len: u32, flags: u8, ident: &[u8]) -> Vec<u8> {
        let mut rec = Vec::new();
        let total = 33 + ident.len() + (1 - ident.len() % 2);
        rec.push(total as u8);
        rec.push(0);
        rec.write_u32::<LittleEndian>(extent).unwrap();
        rec.write_u32::<BigEndian>(extent).unwrap();
        rec.write_u32::<LittleEndian>(len).unwrap();
        rec.write_u32::<BigEndian>(len).unwrap();
        rec.extend_from_slice(&[0u8; 7]);
        rec.push(flags);
        rec.extend_from_slice(&[0, 0]);
        rec.write_u16::<LittleEndian>(1).unwrap();
        rec.write_u16::<BigEndian>(1).unwrap();
        rec.push(ident.len() as u8);
        rec.extend_from_slice(ident);
        rec.resize(total, 0);
        rec
    }

    fn put(image: &mut [u8], offset: usize, bytes: &[u8]) {
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Image with root = [GODOFWAR.TOC, PART1.PAK, DATA/] and DATA = [README.TXT]
    pub(crate) fn build_image(toc: &[u8], pak: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; BS * 26];

        let mut pvd = vec![0u8; BS];
        pvd[0] = 1;
        put(&mut pvd, 1, b"CD001");
        pvd[6] = 1;
        put(&mut pvd, 40, b"GODOFWAR                        ");
        put(&mut pvd, 128, &(BS as u16).to_le_bytes());
        put(&mut pvd, 130, &(BS as u16).to_be_bytes());
        let mut path_table = Vec::new();
        // root
        path_table.extend_from_slice(&[1, 0]);
        path_table.write_u32::<LittleEndian>(19).unwrap();
        path_table.write_u16::<LittleEndian>(1).unwrap();
        path_table.extend_from_slice(&[0, 0]);
        // DATA
        path_table.extend_from_slice(&[4, 0]);
        path_table.write_u32::<LittleEndian>(20).unwrap();
        path_table.write_u16::<LittleEndian>(1).unwrap();
        path_table.extend_from_slice(b"DATA");
        put(&mut pvd, 132, &(path_table.len() as u32).to_le_bytes());
        put(&mut pvd, 140, &18u32.to_le_bytes());
        put(&mut pvd, 156, &dir_record(19, BS as u32, FLAG_DIRECTORY, &[0]));
        put(&mut image, 16 * BS, &pvd);
        image[17 * BS] = 255;
        put(&mut image, 17 * BS + 1, b"CD001");
        put(&mut image, 18 * BS, &path_table);

        let mut root = Vec::new();
        root.extend(dir_record(19, BS as u32, FLAG_DIRECTORY, &[0]));
        root.extend(dir_record(19, BS as u32, FLAG_DIRECTORY, &[1]));
        root.extend(dir_record(21, toc.len() as u32, 0, b"GODOFWAR.TOC;1"));
        root.extend(dir_record(22, pak.len() as u32, 0, b"PART1.PAK;1"));
        root.extend(dir_record(20, BS as u32, FLAG_DIRECTORY, b"DATA"));
        put(&mut image, 19 * BS, &root);

        let mut data = Vec::new();
        data.extend(dir_record(20, BS as u32, FLAG_DIRECTORY, &[0]));
        data.extend(dir_record(19, BS as u32, FLAG_DIRECTORY, &[1]));
        data.extend(dir_record(25, 5, 0, b"README.TXT;1"));
        put(&mut image, 20 * BS, &data);

        assert!(toc.len() <= BS && pak.len() <= 3 * BS);
        put(&mut image, 21 * BS, toc);
        put(&mut image, 22 * BS, pak);
        put(&mut image, 25 * BS, b"hello");
        image
    }

    fn open(image: Vec<u8>) -> (Arc<ArchiveHandle>, IsoDriver) {
        let handle = Arc::new(ArchiveHandle::new(Cursor::new(image)).unwrap());
        let driver = IsoDriver::new(handle.clone()).unwrap();
        (handle, driver)
    }

    #[test]
    fn test_root_listing_in_disk_order() {
        let (_, iso) = open(build_image(b"toc", b"pak data"));
        assert_eq!(iso.volume_id(), "GODOFWAR");
        assert_eq!(
            iso.list().unwrap(),
            vec![
                Entry::file("GODOFWAR.TOC"),
                Entry::file("PART1.PAK"),
                Entry::dir("DATA"),
            ]
        );
    }

    #[test]
    fn test_files_and_subdirectories() {
        let (handle, iso) = open(build_image(b"toc", b"pak data"));
        let pak = iso.get_file("part1.pak").unwrap();
        assert_eq!(pak.size(), 8);
        assert_eq!(&*pak.data().unwrap(), b"pak data");
        assert_eq!(pak.read_range(4, 4).unwrap(), b"data");

        let data = iso.get_directory("DATA").unwrap();
        assert_eq!(data.list().unwrap(), vec![Entry::file("README.TXT")]);
        assert_eq!(&*data.get_file("README.TXT").unwrap().data().unwrap(), b"hello");

        assert!(matches!(iso.get_file("MISSING"), Err(Error::NotFound(_))));
        assert!(matches!(
            iso.get_directory("PART1.PAK"),
            Err(Error::NotADirectory(_))
        ));

        handle.close();
        assert!(matches!(pak.data(), Err(Error::Closed)));
    }

    #[test]
    fn test_bad_signature() {
        let mut image = build_image(b"", b"");
        image[16 * BS + 1] = b'X';
        let handle = Arc::new(ArchiveHandle::new(Cursor::new(image)).unwrap());
        assert!(matches!(IsoDriver::new(handle), Err(Error::Format(_))));

        let handle = Arc::new(ArchiveHandle::new(Cursor::new(vec![0u8; 100])).unwrap());
        assert!(matches!(IsoDriver::new(handle), Err(Error::Format(_))));
    }

    #[test]
    fn test_odd_block_size_rejected() {
        for size in [0u16, 1, 13, 600, 4096] {
            let mut image = build_image(b"", b"");
            put(&mut image, 16 * BS + 128, &size.to_le_bytes());
            let handle = Arc::new(ArchiveHandle::new(Cursor::new(image)).unwrap());
            assert!(
                matches!(IsoDriver::new(handle), Err(Error::Format(_))),
                "block size {}",
                size
            );
        }
    }
}
