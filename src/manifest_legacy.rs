//! Manifests saved before [`EFeatureLevel::StoredAsBinaryData`]. These share the binary header
//! but the payload is a row-oriented dump of the old reflected manifest object, with fields
//! appearing as the feature level introduced them. Only ever read.

use std::io::{Cursor, Read};

use anyhow::{Result, bail};
use tracing::instrument;

use crate::manifest_data::*;
use crate::ser::*;
use crate::{EFeatureLevel, FGuid, FSHAHash};

fn read_chunk_part<S: Read>(s: &mut S) -> Result<FChunkPart> {
    Ok(FChunkPart {
        guid: s.de()?,
        offset: s.de()?,
        size: s.de()?,
    })
}

fn read_file<S: Read>(s: &mut S) -> Result<FFileManifest> {
    let filename = s.de()?;
    let symlink_target = s.de()?;
    let file_hash = s.de()?;
    let file_meta_flags = s.de()?;
    let install_tags = s.de()?;
    let count = s.de::<u32>()? as usize;
    let chunk_parts = read_array(count, s, read_chunk_part)?;
    Ok(FFileManifest {
        filename,
        symlink_target,
        file_hash,
        file_meta_flags,
        install_tags,
        chunk_parts,
        file_size: 0,
    })
}

fn read_chunk<S: Read>(s: &mut S, feature_level: EFeatureLevel) -> Result<FChunkInfo> {
    let guid: FGuid = s.de()?;
    let hash = s.de()?;
    let sha_hash = if feature_level >= EFeatureLevel::StoresChunkDataShaHashes {
        s.de()?
    } else {
        FSHAHash::default()
    };
    let group_number = if feature_level >= EFeatureLevel::StoresDataGroupNumbers {
        s.de()?
    } else {
        FChunkInfo::group_for_guid(&guid)
    };
    let file_size = if feature_level >= EFeatureLevel::StoresChunkFileSizes {
        s.de::<i64>()? as u64
    } else {
        LEGACY_CHUNK_SIZE
    };
    Ok(FChunkInfo {
        guid,
        hash,
        sha_hash,
        file_size,
        group_number,
        window_size: LEGACY_CHUNK_SIZE as u32,
    })
}

/// Parses the decompressed payload of a pre-binary manifest.
#[instrument(skip_all)]
pub fn parse(payload: &[u8], feature_level: EFeatureLevel) -> Result<FManifestData> {
    if feature_level.is_binary() {
        bail!("feature level {feature_level:?} is not a legacy manifest");
    }
    let mut s = Cursor::new(payload);

    let mut meta = FManifestMeta {
        feature_level,
        app_id: s.de()?,
        app_name: s.de()?,
        build_version: s.de()?,
        launch_exe: s.de()?,
        launch_command: s.de()?,
        ..Default::default()
    };
    if feature_level >= EFeatureLevel::StoresPrerequisiteIds {
        meta.prereq_ids = s.de()?;
    }
    if feature_level >= EFeatureLevel::StoresPrerequisitesInfo {
        meta.prereq_name = s.de()?;
        meta.prereq_path = s.de()?;
        meta.prereq_args = s.de()?;
    }
    meta.is_file_data = s.de::<bool>()?;

    let file_count = s.de::<u32>()? as usize;
    let file_list = read_array(file_count, &mut s, read_file)?;
    let chunk_count = s.de::<u32>()? as usize;
    let chunk_list = read_array(chunk_count, &mut s, |s| read_chunk(s, feature_level))?;

    let mut custom_fields = FCustomFields::default();
    if feature_level >= EFeatureLevel::CustomFields {
        let count = s.de::<u32>()? as usize;
        for _ in 0..count {
            let key: String = s.de()?;
            let value: String = s.de()?;
            custom_fields.fields.insert(key, value);
        }
    }

    if meta.prereq_ids.is_empty() {
        let prereq_path = meta.prereq_path.replace('\\', "/");
        if let Some(file) = file_list.iter().find(|f| f.filename == prereq_path) {
            meta.prereq_ids.push(file.file_hash.to_string());
        }
    }
    meta.build_id = meta.runtime_build_id();

    let mut file_manifest_list = FFileManifestList { file_list };
    file_manifest_list.on_post_load();
    Ok(FManifestData {
        meta,
        chunk_data_list: FChunkDataList { chunk_list },
        file_manifest_list,
        custom_fields,
    })
}

/// Writes a legacy manifest. Nothing produces this format any more, this exists to build fixtures.
#[cfg(test)]
pub(crate) fn serialize(data: &FManifestData, feature_level: EFeatureLevel) -> Result<Vec<u8>> {
    let meta = &data.meta;
    let mut payload = vec![];
    let s = &mut payload;
    s.ser(&meta.app_id)?;
    s.ser(&meta.app_name)?;
    s.ser(&meta.build_version)?;
    s.ser(&meta.launch_exe)?;
    s.ser(&meta.launch_command)?;
    if feature_level >= EFeatureLevel::StoresPrerequisiteIds {
        s.ser(&meta.prereq_ids)?;
    }
    if feature_level >= EFeatureLevel::StoresPrerequisitesInfo {
        s.ser(&meta.prereq_name)?;
        s.ser(&meta.prereq_path)?;
        s.ser(&meta.prereq_args)?;
    }
    s.ser(&meta.is_file_data)?;

    let files = &data.file_manifest_list.file_list;
    s.ser(&(files.len() as u32))?;
    for file in files {
        s.ser(&file.filename)?;
        s.ser(&file.symlink_target)?;
        s.ser(&file.file_hash)?;
        s.ser(&file.file_meta_flags)?;
        s.ser(&file.install_tags)?;
        s.ser(&(file.chunk_parts.len() as u32))?;
        for part in &file.chunk_parts {
            s.ser(&part.guid)?;
            s.ser(&part.offset)?;
            s.ser(&part.size)?;
        }
    }
    let chunks = &data.chunk_data_list.chunk_list;
    s.ser(&(chunks.len() as u32))?;
    for chunk in chunks {
        s.ser(&chunk.guid)?;
        s.ser(&chunk.hash)?;
        if feature_level >= EFeatureLevel::StoresChunkDataShaHashes {
            s.ser(&chunk.sha_hash)?;
        }
        if feature_level >= EFeatureLevel::StoresDataGroupNumbers {
            s.ser(&chunk.group_number)?;
        }
        if feature_level >= EFeatureLevel::StoresChunkFileSizes {
            s.ser(&(chunk.file_size as i64))?;
        }
    }
    if feature_level >= EFeatureLevel::CustomFields {
        s.ser(&(data.custom_fields.fields.len() as u32))?;
        for (key, value) in &data.custom_fields.fields {
            s.ser(key)?;
            s.ser(value)?;
        }
    }

    let mut out = vec![];
    write_payload(&mut out, MANIFEST_MAGIC, feature_level, &payload)?;
    Ok(out)
}
