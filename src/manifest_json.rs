//! The JSON manifest format used before manifests were stored as binary data. Integers are
//! stored as "string blobs": every little-endian byte rendered as three decimal digits.

use anyhow::{Context as _, Result, bail};
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value, json};
use tracing::instrument;

use crate::manifest_data::*;
use crate::{EFeatureLevel, FGuid, FSHAHash};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// JSON manifests start with an object, possibly after a byte order mark.
pub fn is_json(data: &[u8]) -> bool {
    data.iter().take(4).any(|&b| b == b'{')
}

pub fn to_string_blob(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:03}")).collect()
}

/// Inverse of [`to_string_blob`]. Shorter blobs leave the high bytes zeroed.
pub fn from_string_blob<const N: usize>(blob: &str) -> Result<[u8; N]> {
    if blob.len() % 3 != 0 || blob.len() / 3 > N || !blob.is_ascii() {
        bail!("invalid string blob {blob:?} for a {N} byte value");
    }
    let mut bytes = [0; N];
    for (dst, digits) in bytes.iter_mut().zip(blob.as_bytes().chunks(3)) {
        let digits = std::str::from_utf8(digits)?;
        *dst = digits.parse().with_context(|| format!("invalid string blob {blob:?}"))?;
    }
    Ok(bytes)
}

fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    obj.get(key).with_context(|| format!("manifest JSON is missing {key:?}"))
}
fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    field(obj, key)?.as_str().with_context(|| format!("manifest JSON field {key:?} is not a string"))
}
fn opt_str_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key).and_then(Value::as_str).unwrap_or_default().to_owned()
}
fn flag_field(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(false)
}
fn blob<const N: usize>(value: &Value, what: &str) -> Result<[u8; N]> {
    let text = value.as_str().with_context(|| format!("{what} is not a string blob"))?;
    from_string_blob(text).with_context(|| format!("invalid {what}"))
}
fn blob_field<const N: usize>(obj: &Map<String, Value>, key: &str) -> Result<[u8; N]> {
    blob(field(obj, key)?, key)
}
/// Missing arrays read as empty, anything else that is not an array is an error.
fn array_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a [Value]> {
    match obj.get(key) {
        None => Ok(&[]),
        Some(value) => value.as_array().map(Vec::as_slice).with_context(|| format!("manifest JSON field {key:?} is not an array")),
    }
}
fn string_array(values: &[Value], key: &str) -> Result<Vec<String>> {
    values
        .iter()
        .map(|v| v.as_str().map(str::to_owned).with_context(|| format!("{key} entry {v} is not a string")))
        .collect()
}
fn object_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<Option<&'a Map<String, Value>>> {
    obj.get(key)
        .map(|v| v.as_object().with_context(|| format!("manifest JSON field {key:?} is not an object")))
        .transpose()
}

#[instrument(skip_all)]
pub fn deserialize(data: &[u8]) -> Result<FManifestData> {
    let data = data.strip_prefix(UTF8_BOM).unwrap_or(data);
    let root: Value = serde_json::from_slice(data).context("manifest is not valid JSON")?;
    let root = root.as_object().context("manifest JSON root is not an object")?;

    // version did not always exist
    let feature_level = match root.get("ManifestFileVersion") {
        Some(value) => match i32::from_le_bytes(blob(value, "ManifestFileVersion")?) {
            EFeatureLevel::BROKEN_JSON_VERSION => EFeatureLevel::StoresChunkFileSizes,
            version => EFeatureLevel::from_version(version)?,
        },
        None => EFeatureLevel::CustomFields,
    };

    let mut meta = FManifestMeta {
        feature_level,
        is_file_data: false,
        app_id: u32::from_le_bytes(blob_field(root, "AppID")?),
        app_name: str_field(root, "AppNameString")?.to_owned(),
        build_version: str_field(root, "BuildVersionString")?.to_owned(),
        launch_exe: str_field(root, "LaunchExeString")?.to_owned(),
        launch_command: str_field(root, "LaunchCommand")?.to_owned(),
        prereq_ids: vec![],
        prereq_name: opt_str_field(root, "PrereqName"),
        prereq_path: opt_str_field(root, "PrereqPath"),
        prereq_args: opt_str_field(root, "PrereqArgs"),
        build_id: String::new(),
    };

    let json_files = field(root, "FileManifestList")?.as_array().context("FileManifestList is not an array")?;
    let mut all_guids = IndexSet::new();
    let mut file_list = Vec::with_capacity(json_files.len());
    for json_file in json_files {
        let obj = json_file.as_object().context("FileManifestList entry is not an object")?;
        let filename = str_field(obj, "Filename")?.to_owned();
        let mut chunk_parts = vec![];
        let json_parts = array_field(obj, "FileChunkParts").with_context(|| format!("file {filename:?}"))?;
        for part in json_parts {
            let part = part.as_object().with_context(|| format!("chunk part of {filename:?} is not an object"))?;
            let guid: FGuid = str_field(part, "Guid")?.parse()?;
            chunk_parts.push(FChunkPart {
                guid,
                offset: u32::from_le_bytes(blob_field(part, "Offset")?),
                size: u32::from_le_bytes(blob_field(part, "Size")?),
            });
            all_guids.insert(guid);
        }
        let install_tags = string_array(array_field(obj, "InstallTags")?, "InstallTags").with_context(|| format!("file {filename:?}"))?;

        let mut file_meta_flags = EFileMetaFlags::empty();
        file_meta_flags.set(EFileMetaFlags::UnixExecutable, flag_field(obj, "bIsUnixExecutable"));
        file_meta_flags.set(EFileMetaFlags::ReadOnly, flag_field(obj, "bIsReadOnly"));
        file_meta_flags.set(EFileMetaFlags::Compressed, flag_field(obj, "bIsCompressed"));

        file_list.push(FFileManifest {
            file_hash: FSHAHash(blob_field(obj, "FileHash").with_context(|| format!("file {filename:?}"))?),
            symlink_target: opt_str_field(obj, "SymlinkTarget"),
            filename,
            file_meta_flags,
            install_tags,
            chunk_parts,
            file_size: 0,
        });
    }

    let mut chunks: IndexMap<FGuid, FChunkInfo> = all_guids
        .into_iter()
        .map(|guid| {
            let chunk = FChunkInfo {
                guid,
                window_size: LEGACY_CHUNK_SIZE as u32,
                ..Default::default()
            };
            (guid, chunk)
        })
        .collect();

    let hash_list = object_field(root, "ChunkHashList")?.context("manifest JSON is missing \"ChunkHashList\"")?;
    let mut has_chunk_hash_list = false;
    for (key, value) in hash_list {
        let guid: FGuid = key.parse()?;
        let hash = u64::from_le_bytes(blob(value, "ChunkHashList entry")?);
        if let Some(chunk) = chunks.get_mut(&guid) {
            chunk.hash = hash;
            has_chunk_hash_list = true;
        }
    }

    if let Some(sha_list) = object_field(root, "ChunkShaList")? {
        for (key, value) in sha_list {
            let guid: FGuid = key.parse()?;
            let sha: FSHAHash = value.as_str().context("ChunkShaList entry is not a string")?.parse()?;
            if let Some(chunk) = chunks.get_mut(&guid) {
                chunk.sha_hash = sha;
            }
        }
    }

    match root.get("PrereqIds") {
        Some(ids) => meta.prereq_ids = string_array(ids.as_array().context("manifest JSON field \"PrereqIds\" is not an array")?, "PrereqIds")?,
        None => {
            // fall back to the hash of the prerequisite installer
            let prereq_path = meta.prereq_path.replace('\\', "/");
            if let Some(file) = file_list.iter().find(|f| f.filename == prereq_path) {
                meta.prereq_ids.push(file.file_hash.to_string());
            }
        }
    }

    match object_field(root, "DataGroupList")? {
        Some(groups) => {
            for (key, value) in groups {
                let guid: FGuid = key.parse()?;
                let [group] = blob::<1>(value, "DataGroupList entry")?;
                if let Some(chunk) = chunks.get_mut(&guid) {
                    chunk.group_number = group;
                }
            }
        }
        None => {
            for chunk in chunks.values_mut() {
                chunk.group_number = FChunkInfo::group_for_guid(&chunk.guid);
            }
        }
    }

    let mut has_chunk_filesize_list = false;
    if let Some(sizes) = object_field(root, "ChunkFilesizeList")? {
        // unparsable entries are ignored
        for (key, value) in sizes {
            let (Ok(guid), Ok(size)) = (key.parse::<FGuid>(), blob::<8>(value, "ChunkFilesizeList entry")) else {
                continue;
            };
            if let Some(chunk) = chunks.get_mut(&guid) {
                chunk.file_size = u64::try_from(i64::from_le_bytes(size)).with_context(|| format!("chunk {guid} has a negative file size"))?;
                has_chunk_filesize_list = true;
            }
        }
    }
    if !has_chunk_filesize_list {
        for chunk in chunks.values_mut() {
            chunk.file_size = LEGACY_CHUNK_SIZE;
        }
    }

    meta.is_file_data = root.get("bIsFileData").and_then(Value::as_bool).unwrap_or(!has_chunk_hash_list);

    let mut custom_fields = FCustomFields::default();
    if let Some(fields) = object_field(root, "CustomFields")? {
        for (key, value) in fields {
            let value = value.as_str().map(str::to_owned).unwrap_or_else(|| value.to_string());
            custom_fields.fields.insert(key.clone(), value);
        }
    }

    let mut file_manifest_list = FFileManifestList { file_list };
    file_manifest_list.on_post_load();

    // file data: each file is exactly one "chunk" holding the whole file
    if meta.is_file_data {
        for file in &file_manifest_list.file_list {
            let [part] = file.chunk_parts.as_slice() else {
                bail!("file data manifest entry {:?} has {} chunk parts, expected 1", file.filename, file.chunk_parts.len());
            };
            if let Some(chunk) = chunks.get_mut(&part.guid) {
                chunk.file_size = file.file_size;
                chunk.sha_hash = file.file_hash;
            }
        }
    }

    meta.build_id = meta.runtime_build_id();

    Ok(FManifestData {
        meta,
        chunk_data_list: FChunkDataList {
            chunk_list: chunks.into_values().collect(),
        },
        file_manifest_list,
        custom_fields,
    })
}

#[instrument(skip_all)]
pub fn serialize(data: &FManifestData, feature_level: EFeatureLevel) -> Result<Vec<u8>> {
    let meta = &data.meta;
    let chunks = &data.chunk_data_list.chunk_list;

    let files: Vec<Value> = data
        .file_manifest_list
        .file_list
        .iter()
        .map(|file| {
            let mut obj = Map::new();
            obj.insert("Filename".into(), file.filename.clone().into());
            obj.insert("FileHash".into(), to_string_blob(&file.file_hash.0).into());
            if file.is_unix_executable() {
                obj.insert("bIsUnixExecutable".into(), true.into());
            }
            if file.is_read_only() {
                obj.insert("bIsReadOnly".into(), true.into());
            }
            if file.is_compressed() {
                obj.insert("bIsCompressed".into(), true.into());
            }
            if file.is_symlink() {
                obj.insert("SymlinkTarget".into(), file.symlink_target.clone().into());
            } else {
                let parts = file
                    .chunk_parts
                    .iter()
                    .map(|part| {
                        json!({
                            "Guid": part.guid.to_string(),
                            "Offset": to_string_blob(&part.offset.to_le_bytes()),
                            "Size": to_string_blob(&part.size.to_le_bytes()),
                        })
                    })
                    .collect();
                obj.insert("FileChunkParts".into(), Value::Array(parts));
            }
            if !file.install_tags.is_empty() {
                obj.insert("InstallTags".into(), file.install_tags.clone().into());
            }
            Value::Object(obj)
        })
        .collect();

    if let Some(chunk) = chunks.iter().find(|c| i64::try_from(c.file_size).is_err()) {
        bail!("chunk {} is too large", chunk.guid);
    }
    let keyed = |value: fn(&FChunkInfo) -> String| -> Map<String, Value> {
        chunks.iter().map(|c| (c.guid.to_string(), Value::String(value(c)))).collect()
    };
    let chunk_hash_list = keyed(|c| to_string_blob(&c.hash.to_le_bytes()));
    let chunk_sha_list = keyed(|c| c.sha_hash.to_string());
    let data_group_list = keyed(|c| to_string_blob(&[c.group_number]));
    let chunk_filesize_list = keyed(|c| to_string_blob(&(c.file_size as i64).to_le_bytes()));

    let root = json!({
        "ManifestFileVersion": to_string_blob(&(feature_level as i32).to_le_bytes()),
        "bIsFileData": meta.is_file_data,
        "AppID": to_string_blob(&meta.app_id.to_le_bytes()),
        "AppNameString": meta.app_name,
        "BuildVersionString": meta.build_version,
        "LaunchExeString": meta.launch_exe,
        "LaunchCommand": meta.launch_command,
        "PrereqIds": meta.prereq_ids,
        "PrereqName": meta.prereq_name,
        "PrereqPath": meta.prereq_path,
        "PrereqArgs": meta.prereq_args,
        "FileManifestList": files,
        "ChunkHashList": chunk_hash_list,
        "ChunkShaList": chunk_sha_list,
        "DataGroupList": data_group_list,
        "ChunkFilesizeList": chunk_filesize_list,
        "CustomFields": data.custom_fields.fields,
    });
    Ok(serde_json::to_vec(&root)?)
}
