use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;

use anyhow::{Context as _, Result, bail};
use fs_err as fs;
use itertools::Itertools as _;
use tracing::instrument;

use crate::block_structure::{Block, BlockStructure};
use crate::file_size_on_disk;
use crate::manifest_data::*;
use crate::manifest_json::{from_string_blob, to_string_blob};
use crate::ser::*;
use crate::{DataFetcher, EFeatureLevel, FGuid, FSHAHash, manifest_json, manifest_legacy};

/// On-disk representation of a manifest, detected from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Json,
    /// Header followed by a pre-binary payload.
    LegacyBinary(EFeatureLevel),
    Binary(EFeatureLevel),
}
impl ManifestFormat {
    pub fn sniff(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            bail!("manifest data is empty");
        }
        if manifest_json::is_json(data) {
            return Ok(Self::Json);
        }
        let header: FManifestHeader = Cursor::new(data).de()?;
        if header.magic != MANIFEST_MAGIC {
            bail!("not a manifest: found magic {}", header.magic);
        }
        Ok(if header.version.is_binary() {
            Self::Binary(header.version)
        } else {
            Self::LegacyBinary(header.version)
        })
    }
}

/// A byte range of an installed file that holds part of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunkPart {
    pub filename: String,
    pub file_offset: u64,
    pub chunk_part: FChunkPart,
}

/// Read-only view of a custom field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomField<'a>(&'a str);
impl<'a> CustomField<'a> {
    pub fn as_string(&self) -> &'a str {
        self.0
    }
    pub fn as_f64(&self) -> Result<f64> {
        Ok(f64::from_le_bytes(from_string_blob(self.0)?))
    }
    pub fn as_i64(&self) -> Result<i64> {
        Ok(i64::from_le_bytes(from_string_blob(self.0)?))
    }
}

/// A loaded manifest plus the lookup tables derived from it.
#[derive(Debug, Clone, Default)]
pub struct BuildPatchAppManifest {
    data: FManifestData,
    chunk_info_lookup: HashMap<FGuid, usize>,
    file_manifest_lookup: HashMap<String, usize>,
    /// File data only: the file that is the chunk.
    file_name_lookup: HashMap<FGuid, usize>,
    /// Untagged files are listed under "".
    tagged_files_lookup: HashMap<String, Vec<usize>>,
    total_build_size: u64,
    total_download_size: u64,
    needs_resaving: bool,
}

impl PartialEq for BuildPatchAppManifest {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl BuildPatchAppManifest {
    /// Normalizes and validates `data` and builds the lookups.
    pub fn new(mut data: FManifestData) -> Result<Self> {
        data.file_manifest_list.on_post_load();
        data.validate()?;
        let mut manifest = Self {
            data,
            ..Default::default()
        };
        manifest.init_lookups();
        Ok(manifest)
    }

    fn init_lookups(&mut self) {
        self.chunk_info_lookup.clear();
        self.file_manifest_lookup.clear();
        self.file_name_lookup.clear();
        self.tagged_files_lookup.clear();

        for (i, chunk) in self.data.chunk_data_list.chunk_list.iter().enumerate() {
            self.chunk_info_lookup.insert(chunk.guid, i);
        }
        for (i, file) in self.data.file_manifest_list.file_list.iter().enumerate() {
            self.file_manifest_lookup.insert(file.filename.clone(), i);
            if file.install_tags.is_empty() {
                self.tagged_files_lookup.entry(String::new()).or_default().push(i);
            }
            for tag in file.install_tags.iter().unique() {
                self.tagged_files_lookup.entry(tag.clone()).or_default().push(i);
            }
            if self.data.meta.is_file_data {
                if let [part] = file.chunk_parts.as_slice() {
                    self.file_name_lookup.insert(part.guid, i);
                }
            }
        }
        self.total_build_size = self.data.file_manifest_list.file_list.iter().map(|f| f.file_size).sum();
        // only chunks some file references are ever downloaded
        let referenced: HashSet<FGuid> = self.files().iter().flat_map(|f| f.chunk_parts.iter().map(|p| p.guid)).collect();
        self.total_download_size = self.data_size_of(&referenced);
    }

    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path.as_ref())?;
        Self::deserialize_from_data(&data).with_context(|| format!("failed to load manifest {}", path.as_ref().display()))
    }

    /// Loads `uri` through `fetcher`, e.g. from a cloud directory.
    pub fn load_from_fetcher(fetcher: &dyn DataFetcher, uri: &str) -> Result<Self> {
        let data = fetcher.fetch(uri).with_context(|| format!("failed to fetch manifest {uri}"))?;
        Self::deserialize_from_data(&data).with_context(|| format!("failed to load manifest {uri}"))
    }

    #[instrument(skip_all)]
    pub fn deserialize_from_data(data: &[u8]) -> Result<Self> {
        let format = ManifestFormat::sniff(data)?;
        let parsed = match format {
            ManifestFormat::Json => manifest_json::deserialize(data)?,
            ManifestFormat::LegacyBinary(_) => {
                let (header, payload) = read_payload(&mut Cursor::new(data), MANIFEST_MAGIC)?;
                manifest_legacy::parse(&payload, header.version)?
            }
            ManifestFormat::Binary(_) => {
                let (_header, payload) = read_payload(&mut Cursor::new(data), MANIFEST_MAGIC)?;
                FManifestData::parse_binary(&payload)?
            }
        };
        let mut manifest = Self::new(parsed)?;
        // clients storing manifests should move to the binary format
        manifest.needs_resaving = !matches!(format, ManifestFormat::Binary(_));
        Ok(manifest)
    }

    /// Binary for `format >= StoredAsBinaryData`, JSON below that.
    pub fn serialize(&self, format: EFeatureLevel) -> Result<Vec<u8>> {
        if format.is_binary() {
            self.data.serialize_binary(format)
        } else {
            manifest_json::serialize(&self.data, format)
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P, format: EFeatureLevel) -> Result<()> {
        let data = self.serialize(format)?;
        fs::write(path.as_ref(), data)?;
        Ok(())
    }

    pub fn data(&self) -> &FManifestData {
        &self.data
    }
    pub fn into_data(self) -> FManifestData {
        self.data
    }
    pub fn meta(&self) -> &FManifestMeta {
        &self.data.meta
    }
    pub fn needs_resaving(&self) -> bool {
        self.needs_resaving
    }
    pub fn feature_level(&self) -> EFeatureLevel {
        self.data.meta.feature_level
    }
    pub fn app_id(&self) -> u32 {
        self.data.meta.app_id
    }
    pub fn app_name(&self) -> &str {
        &self.data.meta.app_name
    }
    pub fn version_string(&self) -> &str {
        &self.data.meta.build_version
    }
    pub fn launch_exe(&self) -> &str {
        &self.data.meta.launch_exe
    }
    pub fn launch_command(&self) -> &str {
        &self.data.meta.launch_command
    }
    pub fn prereq_ids(&self) -> &[String] {
        &self.data.meta.prereq_ids
    }
    pub fn prereq_name(&self) -> &str {
        &self.data.meta.prereq_name
    }
    pub fn prereq_path(&self) -> &str {
        &self.data.meta.prereq_path
    }
    pub fn prereq_args(&self) -> &str {
        &self.data.meta.prereq_args
    }
    pub fn build_id(&self) -> &str {
        &self.data.meta.build_id
    }
    pub fn is_file_data(&self) -> bool {
        self.data.meta.is_file_data
    }

    pub fn files(&self) -> &[FFileManifest] {
        &self.data.file_manifest_list.file_list
    }
    pub fn chunks(&self) -> &[FChunkInfo] {
        &self.data.chunk_data_list.chunk_list
    }
    /// All filenames, sorted.
    pub fn file_list(&self) -> Vec<&str> {
        self.files().iter().map(|f| f.filename.as_str()).collect()
    }
    pub fn data_list(&self) -> Vec<FGuid> {
        self.chunks().iter().map(|c| c.guid).collect()
    }
    /// Every install tag used by the build, including "" when some files are untagged.
    pub fn file_tag_list(&self) -> HashSet<String> {
        self.tagged_files_lookup.keys().cloned().collect()
    }

    pub fn file_manifest(&self, filename: &str) -> Option<&FFileManifest> {
        self.file_manifest_lookup.get(filename).map(|&i| &self.files()[i])
    }
    pub fn chunk_info(&self, guid: &FGuid) -> Option<&FChunkInfo> {
        self.chunk_info_lookup.get(guid).map(|&i| &self.chunks()[i])
    }
    pub fn file_hash(&self, filename: &str) -> Option<FSHAHash> {
        self.file_manifest(filename).map(|f| f.file_hash)
    }
    pub fn file_size(&self, filename: &str) -> u64 {
        self.file_manifest(filename).map_or(0, |f| f.file_size)
    }
    pub fn file_size_of<S: AsRef<str>>(&self, filenames: impl IntoIterator<Item = S>) -> u64 {
        filenames.into_iter().map(|f| self.file_size(f.as_ref())).sum()
    }
    pub fn chunk_hash(&self, guid: &FGuid) -> Option<u64> {
        self.chunk_info(guid).map(|c| c.hash)
    }
    /// `None` when the chunk is unknown or its SHA1 was never recorded.
    pub fn chunk_sha_hash(&self, guid: &FGuid) -> Option<FSHAHash> {
        self.chunk_info(guid).map(|c| c.sha_hash).filter(|sha| !sha.is_zero())
    }

    /// Stored size of a chunk. File data falls back to the size of the file that is the chunk,
    /// anything else unknown is assumed to be a legacy 1 MiB chunk.
    pub fn data_size(&self, guid: &FGuid) -> u64 {
        if let Some(chunk) = self.chunk_info(guid) {
            chunk.file_size
        } else if self.is_file_data() {
            self.file_name_lookup.get(guid).map_or(0, |&i| self.files()[i].file_size)
        } else {
            LEGACY_CHUNK_SIZE
        }
    }
    pub fn data_size_of<'a>(&self, guids: impl IntoIterator<Item = &'a FGuid>) -> u64 {
        guids.into_iter().map(|g| self.data_size(g)).sum()
    }

    pub fn chunks_required_for_files<S: AsRef<str>>(&self, filenames: impl IntoIterator<Item = S>) -> HashSet<FGuid> {
        filenames
            .into_iter()
            .filter_map(|f| self.file_manifest(f.as_ref()))
            .flat_map(|f| f.chunk_parts.iter().map(|p| p.guid))
            .collect()
    }

    /// Files carrying any of `tags`. "" selects the untagged files.
    pub fn tagged_file_list<S: AsRef<str>>(&self, tags: impl IntoIterator<Item = S>) -> BTreeSet<String> {
        tags.into_iter()
            .filter_map(|tag| self.tagged_files_lookup.get(tag.as_ref()))
            .flatten()
            .map(|&i| self.files()[i].filename.clone())
            .collect()
    }

    /// An empty tag set stands for every tag in the build.
    fn tags_or_all<'a>(&self, tags: &'a HashSet<String>) -> Cow<'a, HashSet<String>> {
        if tags.is_empty() {
            Cow::Owned(self.file_tag_list())
        } else {
            Cow::Borrowed(tags)
        }
    }

    pub fn build_size(&self) -> u64 {
        self.total_build_size
    }
    pub fn build_size_for_tags(&self, tags: &HashSet<String>) -> u64 {
        let files = self.tagged_file_list(self.tags_or_all(tags).iter());
        self.file_size_of(&files)
    }
    pub fn download_size(&self) -> u64 {
        self.total_download_size
    }
    /// Chunks shared between tags are counted once.
    pub fn download_size_for_tags(&self, tags: &HashSet<String>) -> u64 {
        let files = self.tagged_file_list(self.tags_or_all(tags).iter());
        self.data_size_of(&self.chunks_required_for_files(&files))
    }

    /// Bytes to download to move an install of `previous` (with `previous_tags`) to this build
    /// with `tags`.
    pub fn delta_download_size(&self, tags: &HashSet<String>, previous: &Self, previous_tags: &HashSet<String>) -> u64 {
        let files_installed = previous.tagged_file_list(previous.tags_or_all(previous_tags).iter());
        let chunks_installed = previous.chunks_required_for_files(&files_installed);

        let tagged = self.tagged_file_list(self.tags_or_all(tags).iter());
        let files_needed = tagged.iter().filter(|f| self.is_file_outdated(previous, f));
        let chunks_needed = self.chunks_required_for_files(files_needed);
        self.data_size_of(chunks_needed.difference(&chunks_installed))
    }

    /// Whether `filename` must be (re)installed coming from `old`.
    pub fn is_file_outdated(&self, old: &Self, filename: &str) -> bool {
        if std::ptr::eq(self, old) {
            return false;
        }
        match (self.file_manifest(filename), old.file_manifest(filename)) {
            (Some(new), Some(old)) => new.file_hash != old.file_hash || new.symlink_target != old.symlink_target,
            _ => true,
        }
    }

    /// Files that differ from `old` (every file if there is none) plus, given an install
    /// directory, files whose size on disk is wrong.
    pub fn outdated_files(&self, old: Option<&Self>, install_dir: Option<&Path>) -> Result<BTreeSet<String>> {
        let mut outdated = BTreeSet::new();
        for file in self.files() {
            let changed = match old {
                Some(old) => self.is_file_outdated(old, &file.filename),
                None => install_dir.is_none(),
            };
            let wrong_on_disk = match install_dir {
                Some(dir) if !changed && !file.is_symlink() => file_size_on_disk(dir.join(&file.filename))? != Some(file.file_size),
                _ => false,
            };
            if changed || wrong_on_disk {
                outdated.insert(file.filename.clone());
            }
        }
        Ok(outdated)
    }

    /// Files of `old` that this build no longer has.
    pub fn removable_files(&self, old: &Self) -> BTreeSet<String> {
        old.files()
            .iter()
            .filter(|f| self.file_manifest(&f.filename).is_none())
            .map(|f| f.filename.clone())
            .collect()
    }

    /// Files found under `install_dir` that this build does not have.
    pub fn removable_files_in_dir(&self, install_dir: &Path) -> Result<BTreeSet<String>> {
        let mut found = vec![];
        walk_dir(install_dir, install_dir, &mut found)?;
        Ok(found.into_iter().filter(|f| self.file_manifest(f).is_none()).collect())
    }

    pub fn number_of_chunk_references(&self, guid: &FGuid) -> usize {
        self.files().iter().flat_map(|f| &f.chunk_parts).filter(|p| p.guid == *guid).count()
    }

    /// Whether any file needs attributes applied after install.
    pub fn has_file_attributes(&self) -> bool {
        self.files().iter().any(|f| !f.file_meta_flags.is_empty())
    }

    /// Every file range that holds data of `guid`, in file order.
    pub fn file_parts_for_chunk(&self, guid: &FGuid) -> Vec<FileChunkPart> {
        let mut parts = vec![];
        for file in self.files() {
            let mut file_offset = 0;
            for part in &file.chunk_parts {
                if part.guid == *guid {
                    parts.push(FileChunkPart {
                        filename: file.filename.clone(),
                        file_offset,
                        chunk_part: *part,
                    });
                }
                file_offset += part.size as u64;
            }
        }
        parts
    }

    /// Marks required chunks whose whole window can be rebuilt from files present in
    /// `install_dir` at their expected size. Returns how many were added to `available`.
    pub fn enumerate_producible_chunks(&self, install_dir: &Path, required: &HashSet<FGuid>, available: &mut HashSet<FGuid>) -> Result<usize> {
        let mut file_ok: HashMap<String, bool> = HashMap::new();
        let mut count = 0;
        for guid in required.iter().sorted() {
            if available.contains(guid) {
                continue;
            }
            let Some(chunk) = self.chunk_info(guid) else {
                continue;
            };
            let parts = self.file_parts_for_chunk(guid);
            let mut coverage = BlockStructure::new();
            for part in &parts {
                coverage.add(part.chunk_part.offset as u64, part.chunk_part.size as u64);
            }
            if coverage.single_block() != Some(Block::new(0, chunk.window_size as u64)) {
                continue;
            }
            let mut producible = true;
            for part in &parts {
                let ok = match file_ok.get(&part.filename) {
                    Some(&ok) => ok,
                    None => {
                        let expected = self.file_size(&part.filename);
                        let ok = file_size_on_disk(install_dir.join(&part.filename))? == Some(expected);
                        file_ok.insert(part.filename.clone(), ok);
                        ok
                    }
                };
                if !ok {
                    producible = false;
                    break;
                }
            }
            if producible {
                available.insert(*guid);
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn custom_field(&self, name: &str) -> Option<CustomField<'_>> {
        self.data.custom_fields.fields.get(name).map(|v| CustomField(v))
    }
    pub fn set_custom_field(&mut self, name: &str, value: &str) {
        self.data.custom_fields.fields.insert(name.to_owned(), value.to_owned());
    }
    pub fn set_custom_field_f64(&mut self, name: &str, value: f64) {
        self.set_custom_field(name, &to_string_blob(&value.to_le_bytes()));
    }
    pub fn set_custom_field_i64(&mut self, name: &str, value: i64) {
        self.set_custom_field(name, &to_string_blob(&value.to_le_bytes()));
    }
    pub fn remove_custom_field(&mut self, name: &str) {
        self.data.custom_fields.fields.shift_remove(name);
    }
    /// Copies all custom fields from `other`, replacing existing values only if `clobber`.
    pub fn copy_custom_fields(&mut self, other: &Self, clobber: bool) {
        for (key, value) in &other.data.custom_fields.fields {
            if clobber || !self.data.custom_fields.fields.contains_key(key) {
                self.data.custom_fields.fields.insert(key.clone(), value.clone());
            }
        }
    }
}

fn walk_dir(root: &Path, dir: &Path, found: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk_dir(root, &path, found)?;
        } else {
            let relative = path.strip_prefix(root)?;
            found.push(relative.components().map(|c| c.as_os_str().to_string_lossy()).join("/"));
        }
    }
    Ok(())
}
