use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use fs_err as fs;
use tracing::instrument;

use crate::logging::*;
use crate::manifest_data::*;
use crate::{BuildPatchAppManifest, EFeatureLevel, FGuid};

/// Which input a merged file is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeSource {
    A,
    B,
}

#[derive(Debug, Clone, Default)]
pub struct MergeManifestsConfiguration {
    pub manifest_a: PathBuf,
    pub manifest_b: PathBuf,
    pub output: PathBuf,
    pub new_version: Option<String>,
    /// `filename<TAB>A|B` per line. When given, only the listed files are merged.
    pub selection_detail: Option<PathBuf>,
}

/// Parses a selection detail file.
pub fn load_selection_detail<P: AsRef<Path>>(path: P) -> Result<HashMap<String, MergeSource>> {
    let text = fs::read_to_string(path.as_ref())?;
    parse_selection_detail(&text).with_context(|| format!("invalid selection detail {}", path.as_ref().display()))
}

fn parse_selection_detail(text: &str) -> Result<HashMap<String, MergeSource>> {
    let mut selection = HashMap::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let Some((filename, source)) = line.rsplit_once('\t') else {
            bail!("line {}: expected \"filename<TAB>A|B\", found {line:?}", i + 1);
        };
        let source = match source.trim() {
            "A" | "a" => MergeSource::A,
            "B" | "b" => MergeSource::B,
            other => bail!("line {}: unknown source {other:?}", i + 1),
        };
        if selection.insert(filename.to_owned(), source).is_some() {
            bail!("line {}: {filename:?} is selected twice", i + 1);
        }
    }
    Ok(selection)
}

/// Chunk infos for every chunk referenced by `files`, in first use order, taken from the first
/// source that knows the chunk.
fn collect_chunk_infos(files: &[FFileManifest], sources: &[&BuildPatchAppManifest]) -> Result<Vec<FChunkInfo>> {
    let mut seen: HashSet<FGuid> = HashSet::new();
    let mut chunk_list = vec![];
    for file in files {
        for part in &file.chunk_parts {
            if !seen.insert(part.guid) {
                continue;
            }
            let Some(info) = sources.iter().find_map(|m| m.chunk_info(&part.guid)) else {
                bail!("chunk {} referenced by {:?} is missing from both manifests", part.guid, file.filename);
            };
            chunk_list.push(*info);
        }
    }
    Ok(chunk_list)
}

/// Combines the files of `a` and `b`. Meta data and custom fields come from `b`.
///
/// Without a selection every file of `b` is kept plus the files only `a` has. With a selection
/// exactly the listed files are taken from their chosen source.
#[instrument(skip_all)]
pub fn merge_manifests(
    a: &BuildPatchAppManifest,
    b: &BuildPatchAppManifest,
    selection: Option<&HashMap<String, MergeSource>>,
    new_version: Option<&str>,
) -> Result<BuildPatchAppManifest> {
    let file_list: Vec<FFileManifest> = match selection {
        Some(selection) => selection
            .iter()
            .map(|(filename, source)| {
                let (manifest, name) = match source {
                    MergeSource::A => (a, "A"),
                    MergeSource::B => (b, "B"),
                };
                manifest
                    .file_manifest(filename)
                    .cloned()
                    .with_context(|| format!("selected file {filename:?} not found in manifest {name}"))
            })
            .collect::<Result<_>>()?,
        None => b
            .files()
            .iter()
            .chain(a.files().iter().filter(|f| b.file_manifest(&f.filename).is_none()))
            .cloned()
            .collect(),
    };

    let mut file_manifest_list = FFileManifestList { file_list };
    file_manifest_list.on_post_load();
    let chunk_list = collect_chunk_infos(&file_manifest_list.file_list, &[b, a])?;

    let mut meta = b.meta().clone();
    if let Some(version) = new_version {
        meta.build_version = version.to_owned();
        meta.build_id = meta.runtime_build_id();
    }
    BuildPatchAppManifest::new(FManifestData {
        meta,
        chunk_data_list: FChunkDataList { chunk_list },
        file_manifest_list,
        custom_fields: b.data().custom_fields.clone(),
    })
}

/// Applies an optimised delta: files present in `delta` take its chunk parts, everything else
/// stays as in `manifest`.
#[instrument(skip_all)]
pub fn merge_delta_manifest(manifest: &BuildPatchAppManifest, delta: &BuildPatchAppManifest) -> Result<BuildPatchAppManifest> {
    let mut data = manifest.data().clone();
    for file in &mut data.file_manifest_list.file_list {
        if let Some(delta_file) = delta.file_manifest(&file.filename) {
            file.chunk_parts = delta_file.chunk_parts.clone();
            file.init();
        }
    }
    data.chunk_data_list.chunk_list = collect_chunk_infos(&data.file_manifest_list.file_list, &[delta, manifest])?;
    BuildPatchAppManifest::new(data)
}

/// Runs a merge described by `config` and writes the result at the feature level of manifest B.
pub fn merge_manifest_files(config: &MergeManifestsConfiguration, log: &Log) -> Result<BuildPatchAppManifest> {
    let (a, b) = rayon::join(
        || BuildPatchAppManifest::load_from_file(&config.manifest_a),
        || BuildPatchAppManifest::load_from_file(&config.manifest_b),
    );
    let (a, b) = (a?, b?);
    let selection = config.selection_detail.as_ref().map(load_selection_detail).transpose()?;

    let merged = merge_manifests(&a, &b, selection.as_ref(), config.new_version.as_deref())?;
    let feature_level = match b.feature_level() {
        level if level.is_binary() => level,
        _ => EFeatureLevel::LATEST,
    };
    merged.save_to_file(&config.output, feature_level)?;
    log!(
        log,
        "merged {} files ({} chunks) into {}",
        merged.files().len(),
        merged.chunks().len(),
        config.output.display()
    );
    Ok(merged)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manifest::test::{sample, sample_patched};
    use crate::manifest_data::test::{chunk, guid, sample_data};
    use crate::FSHAHash;
    use pretty_assertions::assert_eq;

    /// `sample_patched` without the optional pak.
    fn patched_without_optional() -> BuildPatchAppManifest {
        let mut data = sample_patched().into_data();
        data.file_manifest_list.file_list.retain(|f| f.filename != "Content/Paks/Optional.pak");
        BuildPatchAppManifest::new(data).unwrap()
    }

    #[test]
    fn test_merge_falls_back_to_a() -> Result<()> {
        let a = sample();
        let b = patched_without_optional();
        let merged = merge_manifests(&a, &b, None, None)?;
        assert_eq!(vec!["Binaries/Game", "Binaries/Game.exe", "Content/Paks/Optional.pak"], merged.file_list());
        // present in both, B wins
        assert_eq!(b.file_hash("Binaries/Game.exe"), merged.file_hash("Binaries/Game.exe"));
        // only in A
        assert_eq!(a.file_manifest("Content/Paks/Optional.pak"), merged.file_manifest("Content/Paks/Optional.pak"));
        assert_eq!(vec![guid(4), guid(2), guid(3)], merged.data_list());
        assert_eq!(b.version_string(), merged.version_string());
        assert_eq!(b.build_id(), merged.build_id());
        Ok(())
    }

    #[test]
    fn test_merge_with_selection() -> Result<()> {
        let a = sample();
        let b = sample_patched();
        let selection = parse_selection_detail("Binaries/Game.exe\tA\r\n\nContent/Paks/Optional.pak\tb\n")?;
        let merged = merge_manifests(&a, &b, Some(&selection), Some("2.0.0"))?;
        assert_eq!(vec!["Binaries/Game.exe", "Content/Paks/Optional.pak"], merged.file_list());
        assert_eq!(a.file_manifest("Binaries/Game.exe"), merged.file_manifest("Binaries/Game.exe"));
        assert_eq!(vec![guid(1), guid(2), guid(3)], merged.data_list());
        assert_eq!("2.0.0", merged.version_string());
        assert_eq!(merged.meta().runtime_build_id(), merged.build_id());
        Ok(())
    }

    #[test]
    fn test_selection_of_missing_file() {
        let selection = HashMap::from([("Content/Paks/Optional.pak".to_string(), MergeSource::B)]);
        let err = merge_manifests(&sample(), &patched_without_optional(), Some(&selection), None).unwrap_err();
        assert!(err.to_string().contains("not found in manifest B"));
    }

    #[test]
    fn test_parse_selection_detail_errors() {
        assert!(parse_selection_detail("no tab here\n").is_err());
        assert!(parse_selection_detail("file\tC\n").is_err());
        assert!(parse_selection_detail("file\tA\nfile\tB\n").is_err());
    }

    #[test]
    fn test_merge_delta_manifest() -> Result<()> {
        let destination = sample_patched();
        let mut data = sample_data();
        let exe = data.file_manifest_list.file_list.iter_mut().find(|f| f.filename == "Binaries/Game.exe").unwrap();
        exe.file_hash = FSHAHash::from_data(b"exe v2");
        exe.chunk_parts = vec![FChunkPart::new(guid(5), 0, 1000), FChunkPart::new(guid(2), 0, 100)];
        data.file_manifest_list.file_list.retain(|f| f.filename == "Binaries/Game.exe");
        data.chunk_data_list.chunk_list = vec![chunk(5, 321), chunk(2, 90)];
        let delta = BuildPatchAppManifest::new(data)?;

        let merged = merge_delta_manifest(&destination, &delta)?;
        assert_eq!(destination.file_list(), merged.file_list());
        assert_eq!(delta.file_manifest("Binaries/Game.exe").unwrap().chunk_parts, merged.file_manifest("Binaries/Game.exe").unwrap().chunk_parts);
        assert_eq!(vec![guid(5), guid(2), guid(3)], merged.data_list());
        assert_eq!(Some(321), merged.chunk_info(&guid(5)).map(|c| c.file_size));
        assert_eq!(destination.build_id(), merged.build_id());
        Ok(())
    }

    #[test]
    fn test_merge_manifest_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (path_a, path_b) = (dir.path().join("a.manifest"), dir.path().join("b.manifest"));
        sample().save_to_file(&path_a, EFeatureLevel::LATEST)?;
        patched_without_optional().save_to_file(&path_b, EFeatureLevel::LATEST_JSON)?;
        let selection = dir.path().join("selection.txt");
        fs::write(&selection, "Content/Paks/Optional.pak\tA\n")?;

        let config = MergeManifestsConfiguration {
            manifest_a: path_a,
            manifest_b: path_b,
            output: dir.path().join("merged.manifest"),
            new_version: None,
            selection_detail: Some(selection),
        };
        let merged = merge_manifest_files(&config, &Log::quiet())?;
        let loaded = BuildPatchAppManifest::load_from_file(&config.output)?;
        // JSON input is upgraded to binary on output
        assert!(!loaded.needs_resaving());
        assert_eq!(merged.file_list(), loaded.file_list());
        assert_eq!(vec!["Content/Paks/Optional.pak"], loaded.file_list());
        Ok(())
    }
}
