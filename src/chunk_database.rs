//! Chunkdb files bundle chunk files for offline distribution. A small directory of
//! `{guid, offset, size}` entries precedes the concatenated chunk files.

use std::io::{Read, Write};

use anyhow::{Result, bail};
use tracing::instrument;

use crate::FGuid;
use crate::ser::*;

pub const CHUNK_DATABASE_MAGIC: u32 = 0xB1FE3AA3;
const CHUNK_DATABASE_VERSION: u32 = 1;

/// Bytes of the chunkdb header before the entry directory.
pub const HEADER_FIXED_SIZE: u64 = 24;
/// Bytes each chunk adds to the header.
pub const HEADER_ENTRY_SIZE: u64 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FChunkLocation {
    pub guid: FGuid,
    /// Absolute offset of the chunk file within the chunkdb.
    pub byte_start: u64,
    pub byte_size: u32,
}
impl Readable for FChunkLocation {
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self {
            guid: s.de()?,
            byte_start: s.de()?,
            byte_size: s.de()?,
        })
    }
}
impl Writeable for FChunkLocation {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.guid)?;
        s.ser(&self.byte_start)?;
        s.ser(&self.byte_size)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FChunkDatabaseHeader {
    pub version: u32,
    pub header_size: u32,
    /// Total bytes of chunk data following the header.
    pub data_size: u64,
    pub contents: Vec<FChunkLocation>,
}
impl FChunkDatabaseHeader {
    pub fn serialized_size(chunk_count: usize) -> u64 {
        HEADER_FIXED_SIZE + HEADER_ENTRY_SIZE * chunk_count as u64
    }

    /// Header for `(guid, chunk file size)` pairs stored in order right after the header.
    pub fn for_chunks(chunks: impl IntoIterator<Item = (FGuid, u32)>) -> Self {
        let chunks: Vec<_> = chunks.into_iter().collect();
        let header_size = Self::serialized_size(chunks.len());
        let mut offset = header_size;
        let contents = chunks
            .into_iter()
            .map(|(guid, byte_size)| {
                let location = FChunkLocation {
                    guid,
                    byte_start: offset,
                    byte_size,
                };
                offset += byte_size as u64;
                location
            })
            .collect();
        Self {
            version: CHUNK_DATABASE_VERSION,
            header_size: header_size as u32,
            data_size: offset - header_size,
            contents,
        }
    }
}
impl Readable for FChunkDatabaseHeader {
    #[instrument(skip_all, name = "FChunkDatabaseHeader")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        let magic: u32 = s.de()?;
        if magic != CHUNK_DATABASE_MAGIC {
            bail!("invalid chunkdb magic {magic:#010X}");
        }
        let header_size: u32 = s.de()?;
        let version: u32 = s.de()?;
        let data_size: u64 = s.de()?;
        let count: i32 = s.de()?;
        if count < 0 {
            bail!("invalid chunkdb entry count {count}");
        }
        let contents: Vec<FChunkLocation> = s.de_ctx(count as usize)?;
        let consumed = Self::serialized_size(contents.len());
        if (header_size as u64) < consumed {
            bail!("chunkdb header size {header_size} is smaller than its {count} entries");
        }
        let _unknown: Vec<u8> = s.de_ctx((header_size as u64 - consumed) as usize)?;
        Ok(Self {
            version,
            header_size,
            data_size,
            contents,
        })
    }
}
impl Writeable for FChunkDatabaseHeader {
    #[instrument(skip_all, name = "FChunkDatabaseHeader")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&CHUNK_DATABASE_MAGIC)?;
        s.ser(&(Self::serialized_size(self.contents.len()) as u32))?;
        s.ser(&CHUNK_DATABASE_VERSION)?;
        s.ser(&self.data_size)?;
        s.ser(&(self.contents.len() as i32))?;
        s.ser_no_length(&self.contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn test_header_layout() -> Result<()> {
        let header = FChunkDatabaseHeader::for_chunks([(FGuid::new(1, 0, 0, 0), 100), (FGuid::new(2, 0, 0, 0), 50)]);
        assert_eq!(80, header.header_size);
        assert_eq!(150, header.data_size);
        assert_eq!(80, header.contents[0].byte_start);
        assert_eq!(180, header.contents[1].byte_start);

        let mut bytes = vec![];
        header.ser(&mut bytes)?;
        assert_eq!(80, bytes.len());
        assert_eq!(header, Cursor::new(&bytes).de()?);
        Ok(())
    }

    #[test]
    fn test_bad_magic() {
        let bytes = [0u8; 24];
        assert!(Cursor::new(&bytes).de::<FChunkDatabaseHeader>().is_err());
    }
}
