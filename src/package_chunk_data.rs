use std::collections::{BTreeSet, HashSet};
use std::io::{BufWriter, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use fs_err as fs;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::chunk_data::CloudChunkSource;
use crate::chunk_database::{FChunkDatabaseHeader, HEADER_ENTRY_SIZE, HEADER_FIXED_SIZE};
use crate::chunk_reference_tracker::ChunkReferenceTracker;
use crate::logging::*;
use crate::ser::*;
use crate::{BuildPatchAppManifest, EFeatureLevel, FGuid, FSDataFetcher};

#[derive(Debug, Clone)]
pub struct PackageChunksConfiguration {
    /// Cloud directory layout to read chunks from. Defaults to the manifest's feature level.
    pub feature_level: Option<EFeatureLevel>,
    pub manifest_file_path: PathBuf,
    /// Chunks this build shares with the previous one are left out.
    pub prev_manifest_file_path: Option<PathBuf>,
    /// Each tag set gets its own chunkdb files. Empty means one set with every tag.
    pub tag_set_array: Vec<HashSet<String>>,
    /// Base name of the chunkdb files.
    pub output_file: PathBuf,
    pub cloud_dir: PathBuf,
    pub max_output_file_size: u64,
    pub result_data_file_path: Option<PathBuf>,
}
impl Default for PackageChunksConfiguration {
    fn default() -> Self {
        Self {
            feature_level: None,
            manifest_file_path: PathBuf::new(),
            prev_manifest_file_path: None,
            tag_set_array: vec![],
            output_file: PathBuf::new(),
            cloud_dir: PathBuf::new(),
            max_output_file_size: u64::MAX,
            result_data_file_path: None,
        }
    }
}

/// Contents of the result data file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PackageChunksResult {
    pub chunk_db_file_paths: Vec<String>,
    /// Per tag set the indices into `chunk_db_file_paths` holding its chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_set_lookup_table: Option<Vec<Vec<usize>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunkDb {
    pub path: PathBuf,
    pub chunks: Vec<FGuid>,
    /// Upper bound of the file size using the manifest chunk file sizes.
    pub planned_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkDbPlan {
    pub files: Vec<PlannedChunkDb>,
    pub tag_set_lookup_table: Vec<Vec<usize>>,
}

/// Splits `chunks` into groups that fit `max_size` including the chunkdb header. A group
/// always takes at least one chunk.
fn partition_chunks(manifest: &BuildPatchAppManifest, chunks: &[FGuid], max_size: u64) -> Vec<(Vec<FGuid>, u64)> {
    let mut parts = vec![];
    let mut current: Vec<FGuid> = vec![];
    let mut current_size = HEADER_FIXED_SIZE;
    for guid in chunks {
        let added = HEADER_ENTRY_SIZE + manifest.data_size(guid);
        if !current.is_empty() && current_size.saturating_add(added) > max_size {
            parts.push((std::mem::take(&mut current), current_size));
            current_size = HEADER_FIXED_SIZE;
        }
        current.push(*guid);
        current_size = current_size.saturating_add(added);
    }
    if !current.is_empty() {
        parts.push((current, current_size));
    }
    parts
}

fn digits(count: usize) -> usize {
    count.max(1).to_string().len()
}

fn chunk_db_path(base: &Path, tag_set: Option<(usize, usize)>, part: Option<(usize, usize)>) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    if let Some((index, count)) = tag_set {
        name.push(format!(".tagset{:0width$}", index + 1, width = digits(count)));
    }
    if let Some((index, count)) = part {
        name.push(format!(".part{:0width$}", index + 1, width = digits(count)));
    }
    name.push(".chunkdb");
    PathBuf::from(name)
}

/// Decides which chunks go into which chunkdb file.
///
/// Tag sets are visited in order and each only takes chunks no earlier set took. Chunks keep
/// the order in which an install of the tag set's files first needs them.
#[instrument(skip_all)]
pub fn plan_chunk_dbs(
    manifest: &BuildPatchAppManifest,
    prev_manifest: Option<&BuildPatchAppManifest>,
    tag_sets: &[HashSet<String>],
    output_file: &Path,
    max_output_file_size: u64,
) -> Result<ChunkDbPlan> {
    if max_output_file_size <= HEADER_FIXED_SIZE {
        bail!("max output file size {max_output_file_size} does not fit a chunkdb header");
    }
    let all_tags = [manifest.file_tag_list()];
    let tag_sets = if tag_sets.is_empty() { &all_tags[..] } else { tag_sets };

    let outdated = manifest.outdated_files(prev_manifest, None)?;
    let prev_chunks: HashSet<FGuid> = prev_manifest.map(|m| m.data_list().into_iter().collect()).unwrap_or_default();

    let mut visited: HashSet<FGuid> = HashSet::new();
    let mut tag_set_parts = vec![];
    for tags in tag_sets {
        let tags = if tags.is_empty() { &all_tags[0] } else { tags };
        let files: BTreeSet<String> = manifest.tagged_file_list(tags).into_iter().filter(|f| outdated.contains(f)).collect();
        let tracker = ChunkReferenceTracker::new(manifest, &files);
        let chunks = tracker.next_references(usize::MAX, |g| !visited.contains(g) && !prev_chunks.contains(g));
        visited.extend(chunks.iter().copied());
        tag_set_parts.push(partition_chunks(manifest, &chunks, max_output_file_size));
    }

    let base = match output_file.extension() {
        Some(ext) if ext.eq_ignore_ascii_case("chunkdb") => output_file.with_extension(""),
        _ => output_file.to_path_buf(),
    };
    let tag_sets_with_data = tag_set_parts.iter().filter(|parts| !parts.is_empty()).count();
    let mut plan = ChunkDbPlan::default();
    let mut tag_set_index = 0;
    for parts in tag_set_parts {
        let mut lookup = vec![];
        if !parts.is_empty() {
            let tag_set = (tag_sets_with_data > 1).then_some((tag_set_index, tag_sets_with_data));
            let part_count = parts.len();
            for (part_index, (chunks, planned_size)) in parts.into_iter().enumerate() {
                let part = (part_count > 1).then_some((part_index, part_count));
                lookup.push(plan.files.len());
                plan.files.push(PlannedChunkDb {
                    path: chunk_db_path(&base, tag_set, part),
                    chunks,
                    planned_size,
                });
            }
            tag_set_index += 1;
        }
        plan.tag_set_lookup_table.push(lookup);
    }
    Ok(plan)
}

/// Chunk files held in memory at once while writing a chunkdb.
const WRITE_BATCH_SIZE: usize = 64;

/// Streams the chunk files of `file` into place. Sizes are only known once a chunk file is
/// fetched, so a placeholder header of the same size goes first and is overwritten at the end.
fn write_chunk_db(file: &PlannedChunkDb, manifest: &BuildPatchAppManifest, source: &CloudChunkSource, progress: &indicatif::ProgressBar) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(&file.path)?);
    out.ser(&FChunkDatabaseHeader::for_chunks(file.chunks.iter().map(|guid| (*guid, 0))))?;

    let mut sizes = Vec::with_capacity(file.chunks.len());
    for batch in file.chunks.chunks(WRITE_BATCH_SIZE) {
        let chunk_files = batch
            .par_iter()
            .map(|guid| {
                let info = manifest.chunk_info(guid).with_context(|| format!("no chunk info for {guid}"))?;
                let bytes = source.fetch_chunk_file(info)?;
                progress.inc(1);
                Ok(bytes)
            })
            .collect::<Result<Vec<_>>>()?;
        for (guid, bytes) in batch.iter().zip(&chunk_files) {
            sizes.push((*guid, u32::try_from(bytes.len()).context("chunk file too large")?));
            out.write_all(bytes)?;
        }
    }

    out.seek(SeekFrom::Start(0))?;
    out.ser(&FChunkDatabaseHeader::for_chunks(sizes))?;
    out.flush()?;
    Ok(())
}

/// Writes the chunkdb files described by `config`. On failure every file written by this call
/// is removed again.
pub fn package_chunk_data(config: &PackageChunksConfiguration, log: &Log) -> Result<PackageChunksResult> {
    let manifest = BuildPatchAppManifest::load_from_file(&config.manifest_file_path)?;
    let prev_manifest = config
        .prev_manifest_file_path
        .as_ref()
        .map(BuildPatchAppManifest::load_from_file)
        .transpose()?;

    let plan = plan_chunk_dbs(
        &manifest,
        prev_manifest.as_ref(),
        &config.tag_set_array,
        &config.output_file,
        config.max_output_file_size,
    )?;
    let chunk_count = plan.files.iter().map(|f| f.chunks.len()).sum::<usize>();
    log!(log, "packaging {chunk_count} chunks into {} chunkdb files", plan.files.len());

    let fetcher = FSDataFetcher::new(&config.cloud_dir);
    let source = CloudChunkSource::new(&fetcher, config.feature_level.unwrap_or(manifest.feature_level()));
    let progress = log.progress_bar(chunk_count as u64);
    log.set_progress(Some(&progress));

    let mut written = vec![];
    let mut result = Ok(());
    for file in &plan.files {
        if let Some(parent) = file.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(err) = fs::create_dir_all(parent) {
                result = Err(err.into());
                break;
            }
        }
        written.push(&file.path);
        result = write_chunk_db(file, &manifest, &source, &progress).with_context(|| format!("failed to write {}", file.path.display()));
        if result.is_err() {
            break;
        }
        verbose!(log, "wrote {} ({} chunks)", file.path.display(), file.chunks.len());
    }
    progress.finish_and_clear();
    log.set_progress(None);
    if let Err(err) = result {
        for path in written {
            if let Err(remove_err) = fs::remove_file(path) {
                debug!(log, "could not remove {}: {remove_err}", path.display());
            }
        }
        return Err(err);
    }

    let output = PackageChunksResult {
        chunk_db_file_paths: plan.files.iter().map(|f| f.path.to_string_lossy().into_owned()).collect(),
        tag_set_lookup_table: (config.tag_set_array.len() > 1).then_some(plan.tag_set_lookup_table),
    };
    if let Some(path) = &config.result_data_file_path {
        fs::write(path, serde_json::to_string_pretty(&output)?)?;
    }
    Ok(output)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk_data::{chunk_info_from_data, chunk_new_filename, read_chunk, write_chunk};
    use crate::manifest::test::{sample, sample_patched, tags};
    use crate::manifest_data::test::guid;
    use crate::manifest_data::*;
    use crate::FSHAHash;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    /// A build of `count` single chunk files with every chunk file 100 bytes in the cloud
    /// directory. File `i` is tagged with `tag_of(i)`.
    fn cloud_build(dir: &Path, count: u32, tag_of: impl Fn(u32) -> Option<&'static str>) -> Result<BuildPatchAppManifest> {
        let mut data = FManifestData::default();
        for i in 0..count {
            let chunk_data: Vec<u8> = (0..34u8).map(|b| b.wrapping_add(i as u8)).collect();
            let bytes = write_chunk(guid(i + 1), &chunk_data)?;
            assert_eq!(100, bytes.len());
            let info = chunk_info_from_data(guid(i + 1), &chunk_data, bytes.len() as u64);
            let path = dir.join("cloud").join(chunk_new_filename(EFeatureLevel::LATEST, &info));
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(&path, &bytes)?;

            let mut file = FFileManifest::new(format!("file{i:02}.bin"), FSHAHash::from_data(&chunk_data), vec![FChunkPart::new(info.guid, 0, 34)]);
            file.install_tags = tag_of(i).into_iter().map(String::from).collect();
            data.file_manifest_list.file_list.push(file);
            data.chunk_data_list.chunk_list.push(info);
        }
        data.meta.app_name = "Packaged".into();
        let manifest = BuildPatchAppManifest::new(data)?;
        manifest.save_to_file(dir.join("build.manifest"), EFeatureLevel::LATEST)?;
        Ok(manifest)
    }

    fn config(dir: &Path) -> PackageChunksConfiguration {
        PackageChunksConfiguration {
            manifest_file_path: dir.join("build.manifest"),
            output_file: dir.join("out").join("Packaged.chunkdb"),
            cloud_dir: dir.join("cloud"),
            result_data_file_path: Some(dir.join("result.json")),
            ..Default::default()
        }
    }

    #[test]
    fn test_partition_into_three_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest = cloud_build(dir.path(), 10, |_| None)?;
        let config = PackageChunksConfiguration {
            // header plus four entries of 100 bytes
            max_output_file_size: HEADER_FIXED_SIZE + 4 * (HEADER_ENTRY_SIZE + 100),
            ..config(dir.path())
        };
        let result = package_chunk_data(&config, &Log::quiet())?;

        let out = dir.path().join("out");
        let expected: Vec<String> = (1..=3).map(|i| out.join(format!("Packaged.part{i}.chunkdb")).to_string_lossy().into_owned()).collect();
        assert_eq!(expected, result.chunk_db_file_paths);
        assert_eq!(None, result.tag_set_lookup_table);

        let mut chunk_counts = vec![];
        for path in &result.chunk_db_file_paths {
            let bytes = fs::read(path)?;
            assert!(bytes.len() as u64 <= config.max_output_file_size);
            let header: FChunkDatabaseHeader = Cursor::new(&bytes).de()?;
            assert_eq!(bytes.len() as u64, header.header_size as u64 + header.data_size);
            for location in &header.contents {
                let start = location.byte_start as usize;
                let (chunk_header, data) = read_chunk(&bytes[start..start + location.byte_size as usize])?;
                assert_eq!(location.guid, chunk_header.guid);
                assert_eq!(manifest.chunk_sha_hash(&location.guid), Some(FSHAHash::from_data(&data)));
            }
            chunk_counts.push(header.contents.len());
        }
        assert_eq!(vec![4, 4, 2], chunk_counts);

        let sidecar: PackageChunksResult = serde_json::from_slice(&fs::read(dir.path().join("result.json"))?)?;
        assert_eq!(result, sidecar);
        let json: serde_json::Value = serde_json::from_slice(&fs::read(dir.path().join("result.json"))?)?;
        assert!(json.get("TagSetLookupTable").is_none());
        assert_eq!(3, json["ChunkDbFilePaths"].as_array().unwrap().len());
        Ok(())
    }

    #[test]
    fn test_header_rewritten_after_streaming() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let count = WRITE_BATCH_SIZE as u32 + 6;
        let manifest = cloud_build(dir.path(), count, |_| None)?;
        let result = package_chunk_data(&config(dir.path()), &Log::quiet())?;
        let [path] = result.chunk_db_file_paths.as_slice() else {
            panic!("expected one chunkdb, got {:?}", result.chunk_db_file_paths);
        };

        let bytes = fs::read(path)?;
        let header: FChunkDatabaseHeader = Cursor::new(&bytes).de()?;
        assert_eq!(count as usize, header.contents.len());
        assert_eq!(FChunkDatabaseHeader::serialized_size(count as usize), header.header_size as u64);
        assert_eq!(count as u64 * 100, header.data_size);
        assert_eq!(bytes.len() as u64, header.header_size as u64 + header.data_size);
        let mut expected_start = header.header_size as u64;
        for location in &header.contents {
            assert_eq!(expected_start, location.byte_start);
            assert_eq!(100, location.byte_size);
            let start = location.byte_start as usize;
            let (chunk_header, data) = read_chunk(&bytes[start..start + 100])?;
            assert_eq!(location.guid, chunk_header.guid);
            assert_eq!(manifest.chunk_sha_hash(&location.guid), Some(FSHAHash::from_data(&data)));
            expected_start += 100;
        }
        Ok(())
    }

    #[test]
    fn test_single_file_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        cloud_build(dir.path(), 3, |_| None)?;
        let result = package_chunk_data(&config(dir.path()), &Log::quiet())?;
        assert_eq!(vec![dir.path().join("out").join("Packaged.chunkdb").to_string_lossy().into_owned()], result.chunk_db_file_paths);
        Ok(())
    }

    #[test]
    fn test_tag_sets() -> Result<()> {
        let dir = tempfile::tempdir()?;
        cloud_build(dir.path(), 6, |i| (i % 2 == 1).then_some("odd"))?;
        let config = PackageChunksConfiguration {
            // the second set repeats the first and takes nothing new
            tag_set_array: vec![tags(&["odd"]), tags(&["odd"]), tags(&[])],
            max_output_file_size: HEADER_FIXED_SIZE + 2 * (HEADER_ENTRY_SIZE + 100),
            ..config(dir.path())
        };
        let result = package_chunk_data(&config, &Log::quiet())?;
        let names: Vec<String> = result
            .chunk_db_file_paths
            .iter()
            .map(|p| Path::new(p).file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            vec![
                "Packaged.tagset1.part1.chunkdb",
                "Packaged.tagset1.part2.chunkdb",
                "Packaged.tagset2.part1.chunkdb",
                "Packaged.tagset2.part2.chunkdb",
            ],
            names
        );
        assert_eq!(Some(vec![vec![0, 1], vec![], vec![2, 3]]), result.tag_set_lookup_table);

        let json: serde_json::Value = serde_json::from_slice(&fs::read(dir.path().join("result.json"))?)?;
        assert_eq!(3, json["TagSetLookupTable"].as_array().unwrap().len());
        Ok(())
    }

    #[test]
    fn test_plan_against_previous_build() -> Result<()> {
        let prev = sample();
        let manifest = sample_patched();
        let plan = plan_chunk_dbs(&manifest, Some(&prev), &[], Path::new("Patch"), u64::MAX)?;
        assert_eq!(1, plan.files.len());
        assert_eq!(PathBuf::from("Patch.chunkdb"), plan.files[0].path);
        assert_eq!(vec![guid(4)], plan.files[0].chunks);
        assert_eq!(HEADER_FIXED_SIZE + HEADER_ENTRY_SIZE + 500, plan.files[0].planned_size);

        // without a previous build chunks are listed in use order
        let plan = plan_chunk_dbs(&manifest, None, &[], Path::new("Full"), u64::MAX)?;
        assert_eq!(vec![guid(4), guid(2), guid(3)], plan.files[0].chunks);
        Ok(())
    }

    #[test]
    fn test_failure_removes_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest = cloud_build(dir.path(), 4, |_| None)?;
        let missing = manifest.chunk_info(&guid(4)).unwrap();
        fs::remove_file(dir.path().join("cloud").join(chunk_new_filename(EFeatureLevel::LATEST, missing)))?;

        let config = PackageChunksConfiguration {
            max_output_file_size: HEADER_FIXED_SIZE + 2 * (HEADER_ENTRY_SIZE + 100),
            ..config(dir.path())
        };
        assert!(package_chunk_data(&config, &Log::quiet()).is_err());
        assert_eq!(0, fs::read_dir(dir.path().join("out"))?.count());
        assert!(!dir.path().join("result.json").exists());
        Ok(())
    }

    #[test]
    fn test_budget_too_small() {
        assert!(plan_chunk_dbs(&sample(), None, &[], Path::new("x"), HEADER_FIXED_SIZE).is_err());
    }
}
