use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use fs_err as fs;

use buildpatch::diff_manifests::{DiffManifestsConfiguration, diff_manifests};
use buildpatch::logging::Log;
use buildpatch::manifest_data::FChunkInfoFile;
use buildpatch::merge_manifests::{MergeManifestsConfiguration, merge_manifest_files};
use buildpatch::optimised_delta::{DeltaPolicy, get_optimised_delta};
use buildpatch::package_chunk_data::{PackageChunksConfiguration, package_chunk_data};
use buildpatch::{BuildPatchAppManifest, EFeatureLevel, FSDataFetcher};

/// Comma separated install tags. Pass "" for untagged files.
fn parse_tag_set(s: &str) -> Result<HashSet<String>, std::convert::Infallible> {
    Ok(s.split(',').map(|t| t.trim().to_owned()).collect())
}

#[derive(Parser, Debug)]
struct ActionInfo {
    #[arg(index = 1)]
    manifest: PathBuf,
    /// Also list every file
    #[arg(short, long, default_value = "false")]
    files: bool,
}

#[derive(Parser, Debug)]
struct ActionResave {
    #[arg(index = 1)]
    input: PathBuf,
    #[arg(index = 2)]
    output: PathBuf,
    /// Format to save as. Levels before StoredAsBinaryData produce JSON
    #[arg(long, value_enum, default_value_t = EFeatureLevel::LATEST)]
    feature_level: EFeatureLevel,
}

#[derive(Parser, Debug)]
struct ActionDiff {
    /// Manifest A, relative to the cloud directory
    #[arg(index = 1)]
    manifest_a: String,
    /// Manifest B, relative to the cloud directory
    #[arg(index = 2)]
    manifest_b: String,
    #[arg(long, default_value = ".")]
    cloud_dir: PathBuf,
    #[arg(long, value_parser = parse_tag_set)]
    tag_set_a: Option<HashSet<String>>,
    #[arg(long, value_parser = parse_tag_set)]
    tag_set_b: Option<HashSet<String>>,
    /// Additional tag set to report sizes for. May be repeated
    #[arg(long, value_parser = parse_tag_set)]
    compare_tag_set: Vec<HashSet<String>>,
    /// Write the JSON report here
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ActionMerge {
    #[arg(index = 1)]
    manifest_a: PathBuf,
    #[arg(index = 2)]
    manifest_b: PathBuf,
    #[arg(index = 3)]
    output: PathBuf,
    #[arg(long)]
    new_version: Option<String>,
    /// File with one "filename<TAB>A|B" per line
    #[arg(long)]
    selection_detail: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ActionMergeDelta {
    /// Build installed now, relative to the cloud directory
    #[arg(index = 1)]
    source: String,
    /// Build to update to, relative to the cloud directory
    #[arg(index = 2)]
    destination: String,
    #[arg(index = 3)]
    output: PathBuf,
    #[arg(long, default_value = ".")]
    cloud_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = DeltaPolicy::Expect)]
    policy: DeltaPolicy,
}

#[derive(Parser, Debug)]
struct ActionPackage {
    #[arg(index = 1)]
    manifest: PathBuf,
    /// Base name of the chunkdb files
    #[arg(index = 2)]
    output: PathBuf,
    #[arg(long)]
    cloud_dir: PathBuf,
    /// Only package chunks this previous build does not have
    #[arg(long)]
    prev_manifest: Option<PathBuf>,
    /// Tag set to package separately. May be repeated
    #[arg(long, value_parser = parse_tag_set)]
    tag_set: Vec<HashSet<String>>,
    #[arg(long, default_value_t = u64::MAX)]
    max_output_file_size: u64,
    /// Chunk directory layout. Defaults to the manifest's feature level
    #[arg(long, value_enum)]
    feature_level: Option<EFeatureLevel>,
    /// Write the list of produced files as JSON here
    #[arg(long)]
    result_data: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ActionExportChunkInfo {
    #[arg(index = 1)]
    manifest: PathBuf,
    #[arg(index = 2)]
    output: PathBuf,
}

#[derive(Parser, Debug)]
enum Action {
    /// Print manifest meta data and sizes
    Info(ActionInfo),
    /// Load a manifest in any format and save it again
    Resave(ActionResave),
    /// Compare two builds
    Diff(ActionDiff),
    /// Combine the files of two manifests
    Merge(ActionMerge),
    /// Apply the optimised delta between two builds
    MergeDelta(ActionMergeDelta),
    /// Bundle chunks into chunkdb files
    Package(ActionPackage),
    /// Write a chunk info file (meta and chunk list only)
    ExportChunkInfo(ActionExportChunkInfo),
}

#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    #[arg(short, long, default_value = "false")]
    verbose: bool,
    #[arg(long, default_value = "false")]
    debug: bool,
    #[command(subcommand)]
    action: Action,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log = Log::new(args.verbose, args.debug);

    match args.action {
        Action::Info(action) => action_info(action, &log),
        Action::Resave(action) => action_resave(action, &log),
        Action::Diff(action) => action_diff(action, &log),
        Action::Merge(action) => action_merge(action, &log),
        Action::MergeDelta(action) => action_merge_delta(action, &log),
        Action::Package(action) => action_package(action, &log),
        Action::ExportChunkInfo(action) => action_export_chunk_info(action, &log),
    }
}

fn action_info(args: ActionInfo, log: &Log) -> Result<()> {
    let manifest = BuildPatchAppManifest::load_from_file(&args.manifest)?;
    let level: &'static str = manifest.feature_level().into();
    log.log(&format!("{} ({}) {}", manifest.app_name(), manifest.app_id(), manifest.version_string()));
    log.log(&format!("build id:      {}", manifest.build_id()));
    log.log(&format!("feature level: {level} ({})", manifest.feature_level() as u8));
    log.log(&format!("launch:        {} {}", manifest.launch_exe(), manifest.launch_command()));
    if !manifest.prereq_name().is_empty() {
        log.log(&format!(
            "prerequisites: {} ({} {}) ids {:?}",
            manifest.prereq_name(),
            manifest.prereq_path(),
            manifest.prereq_args(),
            manifest.prereq_ids()
        ));
    }
    log.log(&format!("files:         {}", manifest.files().len()));
    log.log(&format!("chunks:        {}", manifest.chunks().len()));
    log.log(&format!("build size:    {}", manifest.build_size()));
    log.log(&format!("download size: {}", manifest.download_size()));

    let mut tags: Vec<_> = manifest.file_tag_list().into_iter().collect();
    tags.sort();
    for tag in tags {
        let set = HashSet::from([tag.clone()]);
        log.log(&format!(
            "  tag {tag:?}: build {} download {}",
            manifest.build_size_for_tags(&set),
            manifest.download_size_for_tags(&set)
        ));
    }
    if manifest.needs_resaving() {
        log.warn("manifest is stored in an old format, consider resaving it");
    }
    if args.files {
        for file in manifest.files() {
            let target = if file.is_symlink() { format!(" -> {}", file.symlink_target) } else { String::new() };
            log.log(&format!("{:>12} {} {}{target}", file.file_size, file.file_hash, file.filename));
        }
    }
    Ok(())
}

fn action_resave(args: ActionResave, log: &Log) -> Result<()> {
    let manifest = BuildPatchAppManifest::load_from_file(&args.input)?;
    manifest.save_to_file(&args.output, args.feature_level)?;
    if log.verbose_enabled() {
        log.log(&format!("saved {} as {:?}", args.output.display(), args.feature_level));
    }
    Ok(())
}

fn action_diff(args: ActionDiff, log: &Log) -> Result<()> {
    let config = DiffManifestsConfiguration {
        manifest_a_uri: args.manifest_a,
        manifest_b_uri: args.manifest_b,
        tag_set_a: args.tag_set_a.unwrap_or_default(),
        tag_set_b: args.tag_set_b.unwrap_or_default(),
        compare_tag_sets: args.compare_tag_set,
        output_file_path: args.output,
    };
    let fetcher = FSDataFetcher::new(args.cloud_dir);
    diff_manifests(&config, &fetcher, log)?;
    Ok(())
}

fn action_merge(args: ActionMerge, log: &Log) -> Result<()> {
    let config = MergeManifestsConfiguration {
        manifest_a: args.manifest_a,
        manifest_b: args.manifest_b,
        output: args.output,
        new_version: args.new_version,
        selection_detail: args.selection_detail,
    };
    merge_manifest_files(&config, log)?;
    Ok(())
}

fn action_merge_delta(args: ActionMergeDelta, log: &Log) -> Result<()> {
    let fetcher = FSDataFetcher::new(args.cloud_dir);
    let (source, destination) = rayon::join(
        || BuildPatchAppManifest::load_from_fetcher(&fetcher, &args.source),
        || BuildPatchAppManifest::load_from_fetcher(&fetcher, &args.destination),
    );
    let (source, destination) = (source?, destination?);
    let delta = get_optimised_delta(&fetcher, &source, &destination, args.policy, log)?;
    delta.manifest.save_to_file(&args.output, destination.feature_level().max(EFeatureLevel::StoredAsBinaryData))?;
    log.log(&format!(
        "wrote {} (delta {} bytes, download {} bytes)",
        args.output.display(),
        delta.meta_download_size,
        delta.manifest.delta_download_size(&HashSet::new(), &source, &HashSet::new())
    ));
    Ok(())
}

fn action_package(args: ActionPackage, log: &Log) -> Result<()> {
    let config = PackageChunksConfiguration {
        feature_level: args.feature_level,
        manifest_file_path: args.manifest,
        prev_manifest_file_path: args.prev_manifest,
        tag_set_array: args.tag_set,
        output_file: args.output,
        cloud_dir: args.cloud_dir,
        max_output_file_size: args.max_output_file_size,
        result_data_file_path: args.result_data,
    };
    let result = package_chunk_data(&config, log)?;
    for path in &result.chunk_db_file_paths {
        log.log(path);
    }
    Ok(())
}

fn action_export_chunk_info(args: ActionExportChunkInfo, log: &Log) -> Result<()> {
    let manifest = BuildPatchAppManifest::load_from_file(&args.manifest)?;
    let info = FChunkInfoFile {
        meta: manifest.meta().clone(),
        chunk_data_list: manifest.data().chunk_data_list.clone(),
    };
    let bytes = info.serialize()?;
    fs::write(&args.output, bytes).with_context(|| format!("failed to write {}", args.output.display()))?;
    if log.debug_enabled() {
        log.log(&format!("chunk info for {} chunks written to {}", manifest.chunks().len(), args.output.display()));
    }
    Ok(())
}
