use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use fs_err as fs;
use itertools::Itertools as _;
use serde::Serialize;

use crate::chunk_data::chunk_new_filename;
use crate::logging::*;
use crate::{BuildPatchAppManifest, DataFetcher};

#[derive(Debug, Clone, Default)]
pub struct DiffManifestsConfiguration {
    pub manifest_a_uri: String,
    pub manifest_b_uri: String,
    /// Tags installed from manifest A. Empty means every tag.
    pub tag_set_a: HashSet<String>,
    pub tag_set_b: HashSet<String>,
    /// Extra tag combinations to report sizes for.
    pub compare_tag_sets: Vec<HashSet<String>>,
    pub output_file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestSummary {
    pub app_name: String,
    pub app_id: u32,
    pub version_string: String,
    pub download_size: u64,
    pub build_size: u64,
    pub individual_tag_download_sizes: BTreeMap<String, u64>,
    pub compare_tag_set_download_sizes: BTreeMap<String, u64>,
    pub compare_tag_set_build_sizes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Differential {
    pub new_file_paths: Vec<String>,
    pub removed_file_paths: Vec<String>,
    pub changed_file_paths: Vec<String>,
    pub unchanged_file_paths: Vec<String>,
    pub new_chunk_paths: Vec<String>,
    pub total_chunk_size: u64,
    pub delta_download_size: u64,
    pub individual_tag_delta_download_sizes: BTreeMap<String, u64>,
    pub compare_tag_set_delta_download_sizes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiffReport {
    pub manifest_a: ManifestSummary,
    pub manifest_b: ManifestSummary,
    pub differential: Differential,
}

/// Report key of a tag set: its tags sorted and comma separated.
pub fn tag_set_key(tags: &HashSet<String>) -> String {
    tags.iter().sorted().join(", ")
}

fn summarize(manifest: &BuildPatchAppManifest, compare_tag_sets: &[HashSet<String>]) -> ManifestSummary {
    let individual_tag_download_sizes = manifest
        .file_tag_list()
        .into_iter()
        .map(|tag| {
            let size = manifest.download_size_for_tags(&HashSet::from([tag.clone()]));
            (tag, size)
        })
        .collect();
    ManifestSummary {
        app_name: manifest.app_name().to_owned(),
        app_id: manifest.app_id(),
        version_string: manifest.version_string().to_owned(),
        download_size: manifest.download_size(),
        build_size: manifest.build_size(),
        individual_tag_download_sizes,
        compare_tag_set_download_sizes: compare_tag_sets
            .iter()
            .map(|set| (tag_set_key(set), manifest.download_size_for_tags(set)))
            .collect(),
        compare_tag_set_build_sizes: compare_tag_sets
            .iter()
            .map(|set| (tag_set_key(set), manifest.build_size_for_tags(set)))
            .collect(),
    }
}

/// Compares installs of `a` with `tag_set_a` and `b` with `tag_set_b`.
pub fn diff(
    a: &BuildPatchAppManifest,
    b: &BuildPatchAppManifest,
    tag_set_a: &HashSet<String>,
    tag_set_b: &HashSet<String>,
    compare_tag_sets: &[HashSet<String>],
) -> DiffReport {
    let all_tags_a = a.file_tag_list();
    let all_tags_b = b.file_tag_list();
    let tags_a = if tag_set_a.is_empty() { &all_tags_a } else { tag_set_a };
    let tags_b = if tag_set_b.is_empty() { &all_tags_b } else { tag_set_b };

    let files_a = a.tagged_file_list(tags_a);
    let files_b = b.tagged_file_list(tags_b);

    let mut differential = Differential::default();
    for filename in files_b.union(&files_a) {
        let paths = match (files_a.contains(filename), files_b.contains(filename)) {
            (false, true) => &mut differential.new_file_paths,
            (true, false) => &mut differential.removed_file_paths,
            _ if b.is_file_outdated(a, filename) => &mut differential.changed_file_paths,
            _ => &mut differential.unchanged_file_paths,
        };
        paths.push(filename.clone());
    }

    let chunks_installed = a.chunks_required_for_files(&files_a);
    let files_needed = files_b.iter().filter(|f| b.is_file_outdated(a, f));
    let new_chunks: BTreeSet<_> = b
        .chunks_required_for_files(files_needed)
        .into_iter()
        .filter(|g| !chunks_installed.contains(g))
        .collect();
    differential.new_chunk_paths = new_chunks
        .iter()
        .filter_map(|g| b.chunk_info(g))
        .map(|chunk| chunk_new_filename(b.feature_level(), chunk))
        .collect();
    differential.total_chunk_size = b.data_size_of(&new_chunks);
    differential.delta_download_size = b.delta_download_size(tags_b, a, tags_a);
    differential.individual_tag_delta_download_sizes = all_tags_b
        .iter()
        .map(|tag| (tag.clone(), b.delta_download_size(&HashSet::from([tag.clone()]), a, tags_a)))
        .collect();
    differential.compare_tag_set_delta_download_sizes = compare_tag_sets
        .iter()
        .map(|set| (tag_set_key(set), b.delta_download_size(set, a, set)))
        .collect();

    DiffReport {
        manifest_a: summarize(a, compare_tag_sets),
        manifest_b: summarize(b, compare_tag_sets),
        differential,
    }
}

/// Loads both manifests, diffs them and optionally writes the JSON report.
pub fn diff_manifests(config: &DiffManifestsConfiguration, fetcher: &dyn DataFetcher, log: &Log) -> Result<DiffReport> {
    let (a, b) = rayon::join(
        || BuildPatchAppManifest::load_from_fetcher(fetcher, &config.manifest_a_uri),
        || BuildPatchAppManifest::load_from_fetcher(fetcher, &config.manifest_b_uri),
    );
    let (a, b) = (a?, b?);

    let report = diff(&a, &b, &config.tag_set_a, &config.tag_set_b, &config.compare_tag_sets);
    let d = &report.differential;
    log!(
        log,
        "{} {} -> {}: {} new, {} removed, {} changed, {} unchanged files",
        b.app_name(),
        a.version_string(),
        b.version_string(),
        d.new_file_paths.len(),
        d.removed_file_paths.len(),
        d.changed_file_paths.len(),
        d.unchanged_file_paths.len()
    );
    log!(log, "{} new chunks, {} bytes, delta download {} bytes", d.new_chunk_paths.len(), d.total_chunk_size, d.delta_download_size);
    for path in &d.new_chunk_paths {
        verbose!(log, "new chunk {path}");
    }

    if let Some(path) = &config.output_file_path {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("failed to write diff report {}", path.display()))?;
    }
    Ok(report)
}
