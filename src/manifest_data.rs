use std::collections::HashSet;
use std::io::{Cursor, Read, Seek, Write};

use anyhow::{Context as _, Result, bail};
use base64::{Engine as _, engine::general_purpose};
use bitflags::bitflags;
use indexmap::IndexMap;
use tracing::instrument;

use crate::compression::{compress_if_smaller, decompress};
use crate::ser::*;
use crate::{EFeatureLevel, FGuid, FSHAHash};

pub const MANIFEST_MAGIC: FGuid = FGuid::new(0x7574140E, 0xFC034A67, 0x9D90154A, 0x1B7F37C3);
pub const CHUNK_INFO_MAGIC: FGuid = FGuid::new(0xA14CEE4F, 0x83554868, 0xBD464C6C, 0x7C50DA70);

/// Chunk size assumed by manifests that never recorded one.
pub const LEGACY_CHUNK_SIZE: u64 = 1048576;

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EFileMetaFlags: u8 {
        const ReadOnly       = 1;
        const Compressed     = 1 << 1;
        const UnixExecutable = 1 << 2;
    }
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct EManifestStorageFlags: u8 {
        const Compressed = 1;
        const Encrypted  = 1 << 1;
    }
}
impl Readable for EFileMetaFlags {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        // unknown bits are carried through untouched
        Ok(Self::from_bits_retain(stream.de()?))
    }
}
impl Writeable for EFileMetaFlags {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.bits())
    }
}
impl Readable for EManifestStorageFlags {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Self::from_bits(stream.de()?).context("invalid EManifestStorageFlags value")
    }
}
impl Writeable for EManifestStorageFlags {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.bits())
    }
}

/// A byte range inside a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FChunkPart {
    pub guid: FGuid,
    pub offset: u32,
    pub size: u32,
}
impl FChunkPart {
    pub fn new(guid: FGuid, offset: u32, size: u32) -> Self {
        Self { guid, offset, size }
    }
    fn de_block<S: Read + Seek>(s: &mut S) -> Result<Self> {
        read_block(s, |s, _version| {
            Ok(Self {
                guid: s.de()?,
                offset: s.de()?,
                size: s.de()?,
            })
        })
    }
    fn ser_block<S: Write>(&self, s: &mut S) -> Result<()> {
        write_block(s, 0, |s| {
            s.ser(&self.guid)?;
            s.ser(&self.offset)?;
            s.ser(&self.size)?;
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FFileManifest {
    pub filename: String,
    pub symlink_target: String,
    pub file_hash: FSHAHash,
    pub file_meta_flags: EFileMetaFlags,
    pub install_tags: Vec<String>,
    pub chunk_parts: Vec<FChunkPart>,
    /// Sum of the chunk part sizes. Recomputed on load, never serialized.
    pub file_size: u64,
}
impl FFileManifest {
    pub fn new(filename: impl Into<String>, file_hash: FSHAHash, chunk_parts: Vec<FChunkPart>) -> Self {
        let mut file = Self {
            filename: filename.into(),
            file_hash,
            chunk_parts,
            ..Default::default()
        };
        file.init();
        file
    }
    pub fn init(&mut self) {
        self.file_size = self.chunk_parts.iter().map(|p| p.size as u64).sum();
    }
    pub fn is_symlink(&self) -> bool {
        !self.symlink_target.is_empty()
    }
    pub fn is_read_only(&self) -> bool {
        self.file_meta_flags.contains(EFileMetaFlags::ReadOnly)
    }
    pub fn is_compressed(&self) -> bool {
        self.file_meta_flags.contains(EFileMetaFlags::Compressed)
    }
    pub fn is_unix_executable(&self) -> bool {
        self.file_meta_flags.contains(EFileMetaFlags::UnixExecutable)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FChunkInfo {
    pub guid: FGuid,
    /// Rolling hash of the uncompressed data, see [`crate::rolling_hash`].
    pub hash: u64,
    pub sha_hash: FSHAHash,
    /// Size of the chunk file as stored in the cloud.
    pub file_size: u64,
    pub group_number: u8,
    /// Uncompressed size of the chunk.
    pub window_size: u32,
}
impl FChunkInfo {
    /// Cloud directory bucket derived from the GUID, used when a manifest does not store one.
    pub fn group_for_guid(guid: &FGuid) -> u8 {
        (crc32fast::hash(&guid.to_bytes()) % 100) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FManifestMeta {
    pub feature_level: EFeatureLevel,
    pub is_file_data: bool,
    pub app_id: u32,
    pub app_name: String,
    pub build_version: String,
    pub launch_exe: String,
    pub launch_command: String,
    pub prereq_ids: Vec<String>,
    pub prereq_name: String,
    pub prereq_path: String,
    pub prereq_args: String,
    pub build_id: String,
}
impl Default for FManifestMeta {
    fn default() -> Self {
        Self {
            feature_level: EFeatureLevel::LATEST,
            is_file_data: false,
            app_id: 0,
            app_name: String::new(),
            build_version: String::new(),
            launch_exe: String::new(),
            launch_command: String::new(),
            prereq_ids: vec![],
            prereq_name: String::new(),
            prereq_path: String::new(),
            prereq_args: String::new(),
            build_id: String::new(),
        }
    }
}

mod meta_version {
    pub const ORIGINAL: u8 = 0;
    pub const SERIALISES_BUILD_ID: u8 = 1;
}

impl FManifestMeta {
    /// Build id for manifests that predate storing one: URL-safe base64 over a SHA1 of the
    /// identifying fields.
    pub fn runtime_build_id(&self) -> String {
        let mut data = vec![];
        data.extend_from_slice(&self.app_id.to_le_bytes());
        for field in [&self.app_name, &self.build_version, &self.launch_exe, &self.launch_command] {
            data.extend_from_slice(field.as_bytes());
            data.push(0);
        }
        let hash = FSHAHash::from_data(&data);
        general_purpose::URL_SAFE_NO_PAD.encode(&hash.0[..16])
    }

    #[instrument(skip_all, name = "FManifestMeta")]
    fn de_block<S: Read + Seek>(s: &mut S) -> Result<Self> {
        read_block(s, |s, version| {
            let mut meta = Self {
                feature_level: EFeatureLevel::from_version(s.de()?)?,
                is_file_data: s.de::<u8>()? != 0,
                app_id: s.de()?,
                app_name: s.de()?,
                build_version: s.de()?,
                launch_exe: s.de()?,
                launch_command: s.de()?,
                prereq_ids: s.de()?,
                prereq_name: s.de()?,
                prereq_path: s.de()?,
                prereq_args: s.de()?,
                build_id: String::new(),
            };
            if version >= meta_version::SERIALISES_BUILD_ID {
                meta.build_id = s.de()?;
            }
            if meta.build_id.is_empty() {
                meta.build_id = meta.runtime_build_id();
            }
            Ok(meta)
        })
    }
    #[instrument(skip_all, name = "FManifestMeta")]
    fn ser_block<S: Write>(&self, s: &mut S) -> Result<()> {
        let version = if self.feature_level >= EFeatureLevel::UsesBuildTimeGeneratedBuildId {
            meta_version::SERIALISES_BUILD_ID
        } else {
            meta_version::ORIGINAL
        };
        write_block(s, version, |s| {
            s.ser(&(self.feature_level as i32))?;
            s.ser(&(self.is_file_data as u8))?;
            s.ser(&self.app_id)?;
            s.ser(&self.app_name)?;
            s.ser(&self.build_version)?;
            s.ser(&self.launch_exe)?;
            s.ser(&self.launch_command)?;
            s.ser(&self.prereq_ids)?;
            s.ser(&self.prereq_name)?;
            s.ser(&self.prereq_path)?;
            s.ser(&self.prereq_args)?;
            if version >= meta_version::SERIALISES_BUILD_ID {
                s.ser(&self.build_id)?;
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FChunkDataList {
    pub chunk_list: Vec<FChunkInfo>,
}
impl FChunkDataList {
    #[instrument(skip_all, name = "FChunkDataList")]
    fn de_block<S: Read + Seek>(s: &mut S) -> Result<Self> {
        read_block(s, |s, _version| {
            let count = s.de::<u32>()? as usize;
            let guids: Vec<FGuid> = s.de_ctx(count)?;
            let hashes: Vec<u64> = s.de_ctx(count)?;
            let sha_hashes: Vec<FSHAHash> = s.de_ctx(count)?;
            let group_numbers: Vec<u8> = s.de_ctx(count)?;
            let window_sizes: Vec<u32> = s.de_ctx(count)?;
            let file_sizes: Vec<i64> = s.de_ctx(count)?;

            let chunk_list = (0..count)
                .map(|i| {
                    Ok(FChunkInfo {
                        guid: guids[i],
                        hash: hashes[i],
                        sha_hash: sha_hashes[i],
                        file_size: u64::try_from(file_sizes[i]).with_context(|| format!("chunk {} has a negative file size", guids[i]))?,
                        group_number: group_numbers[i],
                        window_size: window_sizes[i],
                    })
                })
                .collect::<Result<_>>()?;
            Ok(Self { chunk_list })
        })
    }
    #[instrument(skip_all, name = "FChunkDataList")]
    fn ser_block<S: Write>(&self, s: &mut S) -> Result<()> {
        let chunks = &self.chunk_list;
        write_block(s, 0, |s| {
            s.ser(&(chunks.len() as u32))?;
            for chunk in chunks {
                s.ser(&chunk.guid)?;
            }
            for chunk in chunks {
                s.ser(&chunk.hash)?;
            }
            for chunk in chunks {
                s.ser(&chunk.sha_hash)?;
            }
            for chunk in chunks {
                s.ser(&chunk.group_number)?;
            }
            for chunk in chunks {
                s.ser(&chunk.window_size)?;
            }
            for chunk in chunks {
                s.ser(&i64::try_from(chunk.file_size).with_context(|| format!("chunk {} is too large", chunk.guid))?)?;
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FFileManifestList {
    pub file_list: Vec<FFileManifest>,
}
impl FFileManifestList {
    /// Canonical ordering plus derived sizes. Must run after any load or mutation.
    pub fn on_post_load(&mut self) {
        self.file_list.sort_by(|a, b| a.filename.cmp(&b.filename));
        for file in &mut self.file_list {
            file.init();
        }
    }

    #[instrument(skip_all, name = "FFileManifestList")]
    fn de_block<S: Read + Seek>(s: &mut S) -> Result<Self> {
        read_block(s, |s, _version| {
            let count = s.de::<u32>()? as usize;
            let filenames: Vec<String> = s.de_ctx(count)?;
            let symlink_targets: Vec<String> = s.de_ctx(count)?;
            let file_hashes: Vec<FSHAHash> = s.de_ctx(count)?;
            let file_meta_flags: Vec<EFileMetaFlags> = s.de_ctx(count)?;
            let install_tags: Vec<Vec<String>> = s.de_ctx(count)?;
            let chunk_parts = read_array(count, s, |s| {
                let parts = s.de::<u32>()? as usize;
                read_array(parts, s, FChunkPart::de_block)
            })?;

            let file_list = filenames
                .into_iter()
                .zip(symlink_targets)
                .zip(file_hashes)
                .zip(file_meta_flags)
                .zip(install_tags)
                .zip(chunk_parts)
                .map(|(((((filename, symlink_target), file_hash), file_meta_flags), install_tags), chunk_parts)| FFileManifest {
                    filename,
                    symlink_target,
                    file_hash,
                    file_meta_flags,
                    install_tags,
                    chunk_parts,
                    file_size: 0,
                })
                .collect();
            let mut list = Self { file_list };
            list.on_post_load();
            Ok(list)
        })
    }
    #[instrument(skip_all, name = "FFileManifestList")]
    fn ser_block<S: Write>(&self, s: &mut S) -> Result<()> {
        let files = &self.file_list;
        write_block(s, 0, |s| {
            s.ser(&(files.len() as u32))?;
            for file in files {
                s.ser(&file.filename)?;
            }
            for file in files {
                s.ser(&file.symlink_target)?;
            }
            for file in files {
                s.ser(&file.file_hash)?;
            }
            for file in files {
                s.ser(&file.file_meta_flags)?;
            }
            for file in files {
                s.ser(&file.install_tags)?;
            }
            for file in files {
                s.ser(&(file.chunk_parts.len() as u32))?;
                for part in &file.chunk_parts {
                    part.ser_block(s)?;
                }
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FCustomFields {
    pub fields: IndexMap<String, String>,
}
impl FCustomFields {
    #[instrument(skip_all, name = "FCustomFields")]
    fn de_block<S: Read + Seek>(s: &mut S) -> Result<Self> {
        read_block(s, |s, _version| {
            let count = s.de::<u32>()? as usize;
            let keys: Vec<String> = s.de_ctx(count)?;
            let values: Vec<String> = s.de_ctx(count)?;
            Ok(Self {
                fields: keys.into_iter().zip(values).collect(),
            })
        })
    }
    #[instrument(skip_all, name = "FCustomFields")]
    fn ser_block<S: Write>(&self, s: &mut S) -> Result<()> {
        write_block(s, 0, |s| {
            s.ser(&(self.fields.len() as u32))?;
            for key in self.fields.keys() {
                s.ser(key)?;
            }
            for value in self.fields.values() {
                s.ser(value)?;
            }
            Ok(())
        })
    }
}

/// Fixed header in front of every binary manifest and chunk info file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FManifestHeader {
    pub magic: FGuid,
    pub version: EFeatureLevel,
    pub data_size_compressed: u32,
    pub data_size_uncompressed: u32,
    pub stored_as: EManifestStorageFlags,
    /// SHA1 of the uncompressed payload.
    pub sha_hash: FSHAHash,
}
impl FManifestHeader {
    pub const SIZE: usize = 46;

    /// Payload length on disk.
    pub fn stored_size(&self) -> u32 {
        if self.stored_as.contains(EManifestStorageFlags::Compressed) {
            self.data_size_compressed
        } else {
            self.data_size_uncompressed
        }
    }
}
impl Readable for FManifestHeader {
    #[instrument(skip_all, name = "FManifestHeader")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        let magic: FGuid = s.de()?;
        if magic != MANIFEST_MAGIC && magic != CHUNK_INFO_MAGIC {
            bail!("unrecognized manifest magic {magic}");
        }
        Ok(Self {
            magic,
            version: s.de()?,
            data_size_compressed: s.de()?,
            data_size_uncompressed: s.de()?,
            stored_as: s.de()?,
            sha_hash: s.de()?,
        })
    }
}
impl Writeable for FManifestHeader {
    #[instrument(skip_all, name = "FManifestHeader")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.magic)?;
        s.ser(&self.version)?;
        s.ser(&self.data_size_compressed)?;
        s.ser(&self.data_size_uncompressed)?;
        s.ser(&self.stored_as)?;
        s.ser(&self.sha_hash)?;
        Ok(())
    }
}

/// Hashes and (when it helps) compresses `payload`, then writes header and payload.
#[instrument(skip_all)]
pub fn write_payload<S: Write>(s: &mut S, magic: FGuid, version: EFeatureLevel, payload: &[u8]) -> Result<()> {
    let mut header = FManifestHeader {
        magic,
        version,
        data_size_compressed: payload.len() as u32,
        data_size_uncompressed: payload.len() as u32,
        stored_as: EManifestStorageFlags::empty(),
        sha_hash: FSHAHash::from_data(payload),
    };
    match compress_if_smaller(payload)? {
        Some(compressed) => {
            header.data_size_compressed = compressed.len() as u32;
            header.stored_as |= EManifestStorageFlags::Compressed;
            s.ser(&header)?;
            s.write_all(&compressed)?;
        }
        None => {
            s.ser(&header)?;
            s.write_all(payload)?;
        }
    }
    Ok(())
}

/// Reads header and payload, inflating and verifying the payload hash.
#[instrument(skip_all)]
pub fn read_payload<S: Read>(s: &mut S, magic: FGuid) -> Result<(FManifestHeader, Vec<u8>)> {
    let header: FManifestHeader = s.de()?;
    if header.magic != magic {
        bail!("unexpected magic {}, expected {magic}", header.magic);
    }
    if header.stored_as.contains(EManifestStorageFlags::Encrypted) {
        bail!("encrypted manifests are not supported");
    }
    let stored: Vec<u8> = s.de_ctx(header.stored_size() as usize).context("manifest payload truncated")?;
    let payload = if header.stored_as.contains(EManifestStorageFlags::Compressed) {
        decompress(&stored, header.data_size_uncompressed as usize)?
    } else {
        stored
    };
    let hash = FSHAHash::from_data(&payload);
    if hash != header.sha_hash {
        bail!("manifest payload is corrupt: SHA1 {hash} does not match header {}", header.sha_hash);
    }
    Ok((header, payload))
}

/// Everything a manifest serializes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FManifestData {
    pub meta: FManifestMeta,
    pub chunk_data_list: FChunkDataList,
    pub file_manifest_list: FFileManifestList,
    pub custom_fields: FCustomFields,
}
impl FManifestData {
    /// Binary manifest at `feature_level`, which must be at least `StoredAsBinaryData`.
    #[instrument(skip_all, name = "FManifestData")]
    pub fn serialize_binary(&self, feature_level: EFeatureLevel) -> Result<Vec<u8>> {
        if !feature_level.is_binary() {
            bail!("feature level {feature_level:?} cannot be stored as binary data");
        }
        let mut meta = self.meta.clone();
        meta.feature_level = feature_level;

        let mut payload = vec![];
        meta.ser_block(&mut payload)?;
        self.chunk_data_list.ser_block(&mut payload)?;
        self.file_manifest_list.ser_block(&mut payload)?;
        self.custom_fields.ser_block(&mut payload)?;

        let mut out = Vec::with_capacity(FManifestHeader::SIZE + payload.len());
        write_payload(&mut out, MANIFEST_MAGIC, feature_level, &payload)?;
        Ok(out)
    }

    /// Parses the decompressed payload of a binary manifest.
    #[instrument(skip_all, name = "FManifestData")]
    pub fn parse_binary(payload: &[u8]) -> Result<Self> {
        let mut s = Cursor::new(payload);
        let data = Self {
            meta: FManifestMeta::de_block(&mut s)?,
            chunk_data_list: FChunkDataList::de_block(&mut s)?,
            file_manifest_list: FFileManifestList::de_block(&mut s)?,
            custom_fields: FCustomFields::de_block(&mut s)?,
        };
        Ok(data)
    }

    /// Structural checks shared by every load path.
    pub fn validate(&self) -> Result<()> {
        let chunks: HashSet<FGuid> = self.chunk_data_list.chunk_list.iter().map(|c| c.guid).collect();
        let mut filenames = HashSet::new();
        for file in &self.file_manifest_list.file_list {
            if !filenames.insert(file.filename.as_str()) {
                bail!("duplicate file {:?} in manifest", file.filename);
            }
            for part in &file.chunk_parts {
                if !chunks.contains(&part.guid) {
                    bail!("file {:?} references chunk {} which has no chunk info", file.filename, part.guid);
                }
            }
        }
        Ok(())
    }
}

/// Meta and chunk list only, written under [`CHUNK_INFO_MAGIC`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FChunkInfoFile {
    pub meta: FManifestMeta,
    pub chunk_data_list: FChunkDataList,
}
impl FChunkInfoFile {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut payload = vec![];
        self.meta.ser_block(&mut payload)?;
        self.chunk_data_list.ser_block(&mut payload)?;
        let mut out = vec![];
        write_payload(&mut out, CHUNK_INFO_MAGIC, self.meta.feature_level, &payload)?;
        Ok(out)
    }
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let (_header, payload) = read_payload(&mut Cursor::new(data), CHUNK_INFO_MAGIC)?;
        let mut s = Cursor::new(payload.as_slice());
        Ok(Self {
            meta: FManifestMeta::de_block(&mut s)?,
            chunk_data_list: FChunkDataList::de_block(&mut s)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn guid(n: u32) -> FGuid {
        FGuid::new(n, n.wrapping_mul(31), 0xC0FFEE, 0x1234 + n)
    }

    pub(crate) fn chunk(n: u32, file_size: u64) -> FChunkInfo {
        FChunkInfo {
            guid: guid(n),
            hash: 0x1000 + n as u64,
            sha_hash: FSHAHash::from_data(&n.to_le_bytes()),
            file_size,
            group_number: (n % 100) as u8,
            window_size: 1024,
        }
    }

    pub(crate) fn sample_data() -> FManifestData {
        let mut tagged = FFileManifest::new("Content/Paks/Optional.pak", FSHAHash::from_data(b"optional"), vec![FChunkPart::new(guid(3), 0, 300)]);
        tagged.install_tags = vec!["optional".into()];
        let mut exe = FFileManifest::new(
            "Binaries/Game.exe",
            FSHAHash::from_data(b"exe"),
            vec![FChunkPart::new(guid(1), 0, 1024), FChunkPart::new(guid(2), 0, 100), FChunkPart::new(guid(1), 0, 24)],
        );
        exe.file_meta_flags = EFileMetaFlags::UnixExecutable | EFileMetaFlags::ReadOnly;
        let mut link = FFileManifest::new("Binaries/Game", FSHAHash::default(), vec![]);
        link.symlink_target = "Game.exe".into();

        let mut data = FManifestData {
            meta: FManifestMeta {
                app_id: 7,
                app_name: "Sample".into(),
                build_version: "1.0.0-CL-42".into(),
                launch_exe: "Binaries/Game.exe".into(),
                launch_command: "-fullscreen".into(),
                prereq_ids: vec!["prereq-a".into()],
                prereq_name: "Prereqs".into(),
                prereq_path: "Prereq/Setup.exe".into(),
                prereq_args: "/quiet".into(),
                build_id: "build-1".into(),
                ..Default::default()
            },
            chunk_data_list: FChunkDataList {
                chunk_list: vec![chunk(1, 700), chunk(2, 90), chunk(3, 250)],
            },
            file_manifest_list: FFileManifestList {
                file_list: vec![tagged, exe, link],
            },
            custom_fields: FCustomFields {
                fields: [("BaseUrl".to_string(), "https://cdn".to_string()), ("Ünïcode".to_string(), "välue".to_string())].into_iter().collect(),
            },
        };
        data.file_manifest_list.on_post_load();
        data
    }

    #[test]
    fn test_binary_roundtrip() -> Result<()> {
        let data = sample_data();
        data.validate()?;
        let bytes = data.serialize_binary(EFeatureLevel::LATEST)?;
        let (header, payload) = read_payload(&mut Cursor::new(&bytes), MANIFEST_MAGIC)?;
        assert_eq!(EFeatureLevel::LATEST, header.version);
        let read = FManifestData::parse_binary(&payload)?;
        assert_eq!(data, read);
        assert_eq!(1148, read.file_manifest_list.file_list[1].file_size);
        Ok(())
    }

    #[test]
    fn test_header_layout() -> Result<()> {
        let bytes = sample_data().serialize_binary(EFeatureLevel::LATEST)?;
        assert_eq!(&MANIFEST_MAGIC.to_bytes(), &bytes[0..16]);
        assert_eq!(EFeatureLevel::LATEST as u8, bytes[16]);
        let header: FManifestHeader = Cursor::new(&bytes).de()?;
        assert_eq!(bytes.len(), FManifestHeader::SIZE + header.stored_size() as usize);
        Ok(())
    }

    #[test]
    fn test_old_meta_version_gets_runtime_build_id() -> Result<()> {
        let data = sample_data();
        let bytes = data.serialize_binary(EFeatureLevel::StoredAsBinaryData)?;
        let (_, payload) = read_payload(&mut Cursor::new(&bytes), MANIFEST_MAGIC)?;
        let read = FManifestData::parse_binary(&payload)?;
        assert_eq!(EFeatureLevel::StoredAsBinaryData, read.meta.feature_level);
        assert_eq!(data.meta.runtime_build_id(), read.meta.build_id);
        assert_eq!(22, read.meta.build_id.len());
        Ok(())
    }

    #[test]
    fn test_tampered_payload_is_rejected() -> Result<()> {
        let mut bytes = sample_data().serialize_binary(EFeatureLevel::LATEST)?;
        // header hash no longer matches the payload
        bytes[30] ^= 0xff;
        let err = read_payload(&mut Cursor::new(&bytes), MANIFEST_MAGIC).unwrap_err();
        assert!(format!("{err:#}").contains("corrupt"));
        Ok(())
    }

    #[test]
    fn test_version_too_new_is_rejected() -> Result<()> {
        let mut bytes = sample_data().serialize_binary(EFeatureLevel::LATEST)?;
        bytes[16] = EFeatureLevel::LATEST as u8 + 1;
        let err = read_payload(&mut Cursor::new(&bytes), MANIFEST_MAGIC).unwrap_err();
        assert!(format!("{err:#}").contains("too new"));
        Ok(())
    }

    #[test]
    fn test_chunk_file_size_sign() -> Result<()> {
        let list = FChunkDataList {
            chunk_list: vec![chunk(1, 700)],
        };
        let mut bytes = vec![];
        list.ser_block(&mut bytes)?;
        // file sizes are the last column
        let len = bytes.len();
        bytes[len - 8..].copy_from_slice(&(-700i64).to_le_bytes());
        let err = FChunkDataList::de_block(&mut Cursor::new(&bytes)).unwrap_err();
        assert!(format!("{err:#}").contains("negative file size"), "{err:#}");

        let huge = FChunkDataList {
            chunk_list: vec![chunk(1, u64::MAX)],
        };
        assert!(huge.ser_block(&mut vec![]).is_err());
        Ok(())
    }

    #[test]
    fn test_validate_missing_chunk_info() {
        let mut data = sample_data();
        data.chunk_data_list.chunk_list.retain(|c| c.guid != guid(2));
        assert!(data.validate().is_err());
    }

    #[test]
    fn test_chunk_info_file_roundtrip() -> Result<()> {
        let data = sample_data();
        let file = FChunkInfoFile {
            meta: data.meta.clone(),
            chunk_data_list: data.chunk_data_list.clone(),
        };
        let bytes = file.serialize()?;
        assert_eq!(&CHUNK_INFO_MAGIC.to_bytes(), &bytes[0..16]);
        assert_eq!(file, FChunkInfoFile::deserialize(&bytes)?);
        // a chunk info file is not a manifest
        assert!(read_payload(&mut Cursor::new(&bytes), MANIFEST_MAGIC).is_err());
        Ok(())
    }
}
