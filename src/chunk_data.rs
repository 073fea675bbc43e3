//! Chunk files as stored in the cloud: a fixed header followed by the (optionally zlib
//! compressed) chunk data.

use std::io::{Cursor, Read, Write};

use anyhow::{Context as _, Result, bail};
use bitflags::bitflags;
use tracing::instrument;

use crate::compression::{compress_if_smaller, decompress};
use crate::manifest_data::{FChunkInfo, LEGACY_CHUNK_SIZE};
use crate::rolling_hash::hash_for_data;
use crate::ser::*;
use crate::{DataFetcher, EFeatureLevel, FGuid, FSHAHash};

pub const CHUNK_HEADER_MAGIC: u32 = 0xB1FE3AA2;

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct EChunkStorageFlags: u8 {
        const Compressed = 1;
        const Encrypted  = 1 << 1;
    }
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct EChunkHashFlags: u8 {
        const RollingPoly64 = 1;
        const Sha1          = 1 << 1;
    }
}

mod header_version {
    pub const ORIGINAL: u32 = 1;
    pub const STORES_SHA_AND_HASH_TYPE: u32 = 2;
    pub const STORES_DATA_SIZE_UNCOMPRESSED: u32 = 3;
    pub const LATEST: u32 = STORES_DATA_SIZE_UNCOMPRESSED;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FChunkHeader {
    pub version: u32,
    pub header_size: u32,
    pub data_size_compressed: u32,
    pub guid: FGuid,
    pub rolling_hash: u64,
    pub stored_as: EChunkStorageFlags,
    pub sha_hash: FSHAHash,
    pub hash_type: EChunkHashFlags,
    pub data_size_uncompressed: u32,
}
impl FChunkHeader {
    pub const SIZE: u32 = 66;

    fn serialized_size(version: u32) -> u32 {
        match version {
            header_version::ORIGINAL => 41,
            header_version::STORES_SHA_AND_HASH_TYPE => 62,
            _ => Self::SIZE,
        }
    }
}
impl Readable for FChunkHeader {
    #[instrument(skip_all, name = "FChunkHeader")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        let magic: u32 = s.de()?;
        if magic != CHUNK_HEADER_MAGIC {
            bail!("invalid chunk header magic {magic:#010X}");
        }
        let version: u32 = s.de()?;
        if version == 0 {
            bail!("invalid chunk header version 0");
        }
        let header_size: u32 = s.de()?;
        let mut header = Self {
            version,
            header_size,
            data_size_compressed: s.de()?,
            guid: s.de()?,
            rolling_hash: s.de()?,
            stored_as: EChunkStorageFlags::from_bits(s.de()?).context("invalid chunk storage flags")?,
            sha_hash: FSHAHash::default(),
            hash_type: EChunkHashFlags::RollingPoly64,
            data_size_uncompressed: LEGACY_CHUNK_SIZE as u32,
        };
        if version >= header_version::STORES_SHA_AND_HASH_TYPE {
            header.sha_hash = s.de()?;
            header.hash_type = EChunkHashFlags::from_bits(s.de()?).context("invalid chunk hash flags")?;
        }
        if version >= header_version::STORES_DATA_SIZE_UNCOMPRESSED {
            header.data_size_uncompressed = s.de()?;
        }
        let consumed = Self::serialized_size(version.min(header_version::LATEST));
        if header_size < consumed {
            bail!("chunk header size {header_size} is smaller than its fields ({consumed} bytes)");
        }
        // newer versions may append fields
        let _unknown: Vec<u8> = s.de_ctx((header_size - consumed) as usize)?;
        Ok(header)
    }
}
impl Writeable for FChunkHeader {
    #[instrument(skip_all, name = "FChunkHeader")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&CHUNK_HEADER_MAGIC)?;
        s.ser(&header_version::LATEST)?;
        s.ser(&Self::SIZE)?;
        s.ser(&self.data_size_compressed)?;
        s.ser(&self.guid)?;
        s.ser(&self.rolling_hash)?;
        s.ser(&self.stored_as.bits())?;
        s.ser(&self.sha_hash)?;
        s.ser(&self.hash_type.bits())?;
        s.ser(&self.data_size_uncompressed)?;
        Ok(())
    }
}

/// Cloud path of a chunk, relative to the cloud directory.
pub fn chunk_new_filename(feature_level: EFeatureLevel, chunk: &FChunkInfo) -> String {
    format!(
        "{}/{:02}/{:016X}_{}.chunk",
        feature_level.chunk_subdir(),
        chunk.group_number,
        chunk.hash,
        chunk.guid
    )
}

/// Chunk info describing `data` stored in a chunk file of `file_size` bytes.
pub fn chunk_info_from_data(guid: FGuid, data: &[u8], file_size: u64) -> FChunkInfo {
    FChunkInfo {
        guid,
        hash: hash_for_data(data),
        sha_hash: FSHAHash::from_data(data),
        file_size,
        group_number: FChunkInfo::group_for_guid(&guid),
        window_size: data.len() as u32,
    }
}

/// Encodes a chunk file, compressing the data when that makes it smaller.
#[instrument(skip_all, fields(%guid))]
pub fn write_chunk(guid: FGuid, data: &[u8]) -> Result<Vec<u8>> {
    let mut header = FChunkHeader {
        version: header_version::LATEST,
        header_size: FChunkHeader::SIZE,
        data_size_compressed: data.len() as u32,
        guid,
        rolling_hash: hash_for_data(data),
        stored_as: EChunkStorageFlags::empty(),
        sha_hash: FSHAHash::from_data(data),
        hash_type: EChunkHashFlags::RollingPoly64 | EChunkHashFlags::Sha1,
        data_size_uncompressed: data.len() as u32,
    };
    let compressed = compress_if_smaller(data)?;
    if let Some(compressed) = &compressed {
        header.stored_as |= EChunkStorageFlags::Compressed;
        header.data_size_compressed = compressed.len() as u32;
    }
    let payload = compressed.as_deref().unwrap_or(data);
    let mut out = Vec::with_capacity(FChunkHeader::SIZE as usize + payload.len());
    header.ser(&mut out)?;
    out.write_all(payload)?;
    Ok(out)
}

/// Decodes and verifies a chunk file, returning its header and uncompressed data.
#[instrument(skip_all)]
pub fn read_chunk(bytes: &[u8]) -> Result<(FChunkHeader, Vec<u8>)> {
    let header: FChunkHeader = Cursor::new(bytes).de()?;
    if header.stored_as.contains(EChunkStorageFlags::Encrypted) {
        bail!("chunk {} is encrypted", header.guid);
    }
    let start = header.header_size as usize;
    let end = start + header.data_size_compressed as usize;
    let stored = bytes
        .get(start..end)
        .with_context(|| format!("chunk {} truncated: {} bytes, expected {end}", header.guid, bytes.len()))?;
    let data = if header.stored_as.contains(EChunkStorageFlags::Compressed) {
        decompress(stored, header.data_size_uncompressed as usize)?
    } else {
        stored.to_vec()
    };
    if header.hash_type.contains(EChunkHashFlags::Sha1) && FSHAHash::from_data(&data) != header.sha_hash {
        bail!("chunk {} is corrupt: SHA1 mismatch", header.guid);
    }
    if header.hash_type.contains(EChunkHashFlags::RollingPoly64) && hash_for_data(&data) != header.rolling_hash {
        bail!("chunk {} is corrupt: rolling hash mismatch", header.guid);
    }
    Ok((header, data))
}

/// Fetches chunk files from a cloud directory laid out for `feature_level`.
pub struct CloudChunkSource<'a> {
    fetcher: &'a dyn DataFetcher,
    feature_level: EFeatureLevel,
}
impl<'a> CloudChunkSource<'a> {
    pub fn new(fetcher: &'a dyn DataFetcher, feature_level: EFeatureLevel) -> Self {
        Self { fetcher, feature_level }
    }

    /// Verified chunk file bytes for `chunk`, compressed if possible.
    pub fn fetch_chunk_file(&self, chunk: &FChunkInfo) -> Result<Vec<u8>> {
        let path = chunk_new_filename(self.feature_level, chunk);
        let bytes = self.fetcher.fetch(&path).with_context(|| format!("failed to fetch chunk {path}"))?;
        let (header, data) = read_chunk(&bytes).with_context(|| format!("invalid chunk file {path}"))?;
        if header.guid != chunk.guid {
            bail!("chunk file {path} holds chunk {}, expected {}", header.guid, chunk.guid);
        }
        if !chunk.sha_hash.is_zero() && header.hash_type.contains(EChunkHashFlags::Sha1) && header.sha_hash != chunk.sha_hash {
            bail!("chunk file {path} does not match the manifest SHA1");
        }
        if header.stored_as.contains(EChunkStorageFlags::Compressed) || compress_if_smaller(&data)?.is_none() {
            Ok(bytes)
        } else {
            write_chunk(chunk.guid, &data)
        }
    }

    /// Uncompressed chunk data.
    pub fn get(&self, chunk: &FChunkInfo) -> Result<Vec<u8>> {
        let bytes = self.fetch_chunk_file(chunk)?;
        Ok(read_chunk(&bytes)?.1)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FSDataFetcher;
    use fs_err as fs;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_chunk_roundtrip() -> Result<()> {
        let guid = FGuid::new(1, 2, 3, 4);
        let data = vec![5u8; 4096];
        let bytes = write_chunk(guid, &data)?;
        assert_eq!(&CHUNK_HEADER_MAGIC.to_le_bytes(), &bytes[..4]);
        let (header, read) = read_chunk(&bytes)?;
        assert_eq!(guid, header.guid);
        assert!(header.stored_as.contains(EChunkStorageFlags::Compressed));
        assert_eq!(FChunkHeader::SIZE as usize + header.data_size_compressed as usize, bytes.len());
        assert_eq!(data, read);
        Ok(())
    }

    #[test]
    fn test_incompressible_chunk_stored_raw() -> Result<()> {
        let data: Vec<u8> = (0..34u8).collect();
        let bytes = write_chunk(FGuid::new(9, 9, 9, 9), &data)?;
        assert_eq!(100, bytes.len());
        let (header, read) = read_chunk(&bytes)?;
        assert!(header.stored_as.is_empty());
        assert_eq!(data, read);
        Ok(())
    }

    #[test]
    fn test_corrupt_chunk() -> Result<()> {
        let mut bytes = write_chunk(FGuid::new(1, 1, 1, 1), &(0..34u8).collect::<Vec<_>>())?;
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        assert!(read_chunk(&bytes).unwrap_err().to_string().contains("corrupt"));
        assert!(read_chunk(&bytes[..70]).is_err());
        Ok(())
    }

    #[test]
    fn test_chunk_path() {
        let info = FChunkInfo {
            guid: FGuid::new(0xA, 0xB, 0xC, 0xD),
            hash: 0x1234,
            group_number: 7,
            ..Default::default()
        };
        assert_eq!(
            "ChunksV4/07/0000000000001234_0000000A0000000B0000000C0000000D.chunk",
            chunk_new_filename(EFeatureLevel::LATEST, &info)
        );
    }

    #[test]
    fn test_cloud_chunk_source() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let guid = FGuid::new(4, 3, 2, 1);
        let data = vec![1u8; 1000];
        let bytes = write_chunk(guid, &data)?;
        let info = chunk_info_from_data(guid, &data, bytes.len() as u64);
        let path = dir.path().join(chunk_new_filename(EFeatureLevel::LATEST, &info));
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(&path, &bytes)?;

        let fetcher = FSDataFetcher::new(dir.path());
        let source = CloudChunkSource::new(&fetcher, EFeatureLevel::LATEST);
        assert_eq!(data, source.get(&info)?);
        assert_eq!(bytes, source.fetch_chunk_file(&info)?);

        let wrong = FChunkInfo {
            sha_hash: FSHAHash::from_data(b"other"),
            ..info
        };
        assert!(source.get(&wrong).is_err());
        Ok(())
    }
}
