//! Tag records
//!
//! ## Record layout
//!
//! | Field | Size |
//! |-------|------|
//! | id | u32 |
//! | tag type | u16 |
//! | name length | u16 |
//! | name | name length |
//! | payload length | u32 |
//! | payload | payload length |
//!
//! Integers use the platform byte order (big-endian on PS3).

use std::io::{Cursor, ErrorKind as IoErrorKind, Read};
use std::marker::PhantomData;

use byteorder::{ByteOrder, ReadBytesExt};
use serde::Serialize;

use super::TagId;
use crate::error::{Error, Result};

/// One record of a tag stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag {
    pub id: TagId,
    pub tag_type: u16,
    pub name: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    /// Offset of the record in the stream
    pub debug_offset: u64,
}

impl Tag {
    /// Names starting with a space are unnamed
    pub fn is_named(&self) -> bool {
        !self.name.is_empty() && !self.name.starts_with(' ')
    }
}

/// Sequential reader over tag records
pub struct TagReader<'a, B: ByteOrder> {
    cursor: Cursor<&'a [u8]>,
    _order: PhantomData<B>,
}

impl<'a, B: ByteOrder> TagReader<'a, B> {
    pub fn new(data: &'a [u8]) -> Self {
        TagReader {
            cursor: Cursor::new(data),
            _order: PhantomData,
        }
    }

    /// Next record, or `None` on a clean end at a record boundary
    pub fn next_tag(&mut self) -> Result<Option<Tag>> {
        let offset = self.cursor.position();
        if offset >= self.cursor.get_ref().len() as u64 {
            return Ok(None);
        }
        self.read_record(offset).map(Some).map_err(|e| match e {
            Error::Io(io) if io.kind() == IoErrorKind::UnexpectedEof => {
                Error::Corrupt(format!("truncated tag record at {:#x}", offset))
            }
            other => other,
        })
    }

    fn read_record(&mut self, offset: u64) -> Result<Tag> {
        let id = self.cursor.read_u32::<B>()?;
        let tag_type = self.cursor.read_u16::<B>()?;
        let name_len = self.cursor.read_u16::<B>()? as usize;
        let mut name = vec![0u8; name_len];
        self.cursor.read_exact(&mut name)?;
        let payload_len = self.cursor.read_u32::<B>()? as u64;

        let remaining = self.cursor.get_ref().len() as u64 - self.cursor.position();
        if payload_len > remaining {
            return Err(Error::Corrupt(format!(
                "tag {} at {:#x}: payload of {:#x} bytes exceeds stream",
                id, offset, payload_len
            )));
        }
        let mut data = vec![0u8; payload_len as usize];
        self.cursor.read_exact(&mut data)?;

        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        Ok(Tag {
            id: TagId(id),
            tag_type,
            name: String::from_utf8_lossy(&name[..end]).into_owned(),
            data,
            debug_offset: offset,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
    use std::io::Write;

    /// Builds tag streams for tests
    pub(crate) struct StreamBuilder<B: ByteOrder> {
        buf: Vec<u8>,
        _order: PhantomData<B>,
    }

    impl<B: ByteOrder> StreamBuilder<B> {
        pub(crate) fn new() -> Self {
            StreamBuilder {
                buf: Vec::new(),
                _order: PhantomData,
            }
        }

        pub(crate) fn tag(mut self, id: u32, tag_type: u16, name: &str, data: &[u8]) -> Self {
            self.buf.write_u32::<B>(id).unwrap();
            self.buf.write_u16::<B>(tag_type).unwrap();
            self.buf.write_u16::<B>(name.len() as u16).unwrap();
            self.buf.write_all(name.as_bytes()).unwrap();
            self.buf.write_u32::<B>(data.len() as u32).unwrap();
            self.buf.write_all(data).unwrap();
            self
        }

        pub(crate) fn build(self) -> Vec<u8> {
            self.buf
        }
    }

    #[test]
    fn test_read_records() {
        let data = StreamBuilder::<LittleEndian>::new()
            .tag(1, 0x1e, "hero", &[1, 0, 0, 0, 9])
            .tag(2, 0x28, "", &[])
            .build();
        let mut reader = TagReader::<LittleEndian>::new(&data);

        let first = reader.next_tag().unwrap().unwrap();
        assert_eq!(first.id, TagId(1));
        assert_eq!(first.tag_type, 0x1e);
        assert_eq!(first.name, "hero");
        assert_eq!(first.data, vec![1, 0, 0, 0, 9]);
        assert_eq!(first.debug_offset, 0);

        let second = reader.next_tag().unwrap().unwrap();
        assert_eq!(second.debug_offset, 4 + 2 + 2 + 4 + 4 + 5);
        assert!(!second.is_named());
        assert!(reader.next_tag().unwrap().is_none());
    }

    #[test]
    fn test_big_endian_records() {
        let data = StreamBuilder::<BigEndian>::new()
            .tag(0x0102, 1, "x", &[])
            .build();
        assert_eq!(&data[..4], &[0, 0, 1, 2]);
        let tag = TagReader::<BigEndian>::new(&data).next_tag().unwrap().unwrap();
        assert_eq!(tag.id, TagId(0x0102));
        assert_eq!(tag.tag_type, 1);
    }

    #[test]
    fn test_truncated_record() {
        let data = StreamBuilder::<LittleEndian>::new()
            .tag(1, 0x1e, "hero", &[1, 2, 3, 4])
            .build();
        for cut in [3, 9, data.len() - 1] {
            let mut reader = TagReader::<LittleEndian>::new(&data[..cut]);
            assert!(
                matches!(reader.next_tag(), Err(Error::Corrupt(_))),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_unnamed() {
        let tag = Tag {
            id: TagId(1),
            tag_type: 0,
            name: " anon".into(),
            data: vec![],
            debug_offset: 0,
        };
        assert!(!tag.is_named());
    }
}
