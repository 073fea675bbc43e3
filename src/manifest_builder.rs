use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context as _, Result, bail};
use indexmap::IndexMap;

use crate::block_structure::{Block, BlockStructure};
use crate::manifest_data::*;
use crate::{BuildPatchAppManifest, EFeatureLevel, FGuid, FSHAHash};

/// Meta data for a new build.
#[derive(Debug, Clone, Default)]
pub struct ManifestDetails {
    pub feature_level: EFeatureLevel,
    pub app_id: u32,
    pub app_name: String,
    pub build_version: String,
    pub launch_exe: String,
    pub launch_command: String,
    pub prereq_ids: Vec<String>,
    pub prereq_name: String,
    pub prereq_path: String,
    pub prereq_args: String,
    /// Derived from the other fields when not given.
    pub build_id: Option<String>,
    pub custom_fields: IndexMap<String, String>,
}

/// Where a file sits in the build image.
#[derive(Debug, Clone, Default)]
pub struct FileSpan {
    pub filename: String,
    pub start_idx: u64,
    pub size: u64,
    pub sha_hash: FSHAHash,
    pub meta_flags: EFileMetaFlags,
    pub install_tags: Vec<String>,
    pub symlink_target: String,
}
impl FileSpan {
    fn end(&self) -> u64 {
        self.start_idx + self.size
    }
}

/// A single range of the build image covered by a chunk.
#[derive(Debug, Clone, Copy)]
struct ChunkPiece {
    build: Block,
    guid: FGuid,
    chunk_offset: u64,
}

/// Constructs a manifest from the chunk matches found for a build image and the file layout
/// inside that image.
#[derive(Debug)]
pub struct ManifestBuilder {
    details: ManifestDetails,
    all_chunk_matches: BlockStructure,
    chunk_matches: Vec<(FGuid, BlockStructure)>,
    build_size: u64,
    data: Option<FManifestData>,
}

impl ManifestBuilder {
    pub fn new(details: ManifestDetails) -> Self {
        Self {
            details,
            all_chunk_matches: BlockStructure::new(),
            chunk_matches: vec![],
            build_size: 0,
            data: None,
        }
    }

    /// Records that `structure` (build image offsets) is stored by chunk `guid`, in order.
    ///
    /// # Panics
    /// If `structure` overlaps a previously added match.
    pub fn add_chunk_match(&mut self, guid: FGuid, structure: BlockStructure) {
        assert!(
            !self.all_chunk_matches.intersects(&structure),
            "chunk match for {guid} overlaps an existing match: {structure:?}"
        );
        self.all_chunk_matches.add_structure(&structure);
        self.chunk_matches.push((guid, structure));
    }

    fn pieces(&self) -> Vec<ChunkPiece> {
        let mut pieces = vec![];
        for (guid, structure) in &self.chunk_matches {
            let mut chunk_offset = 0;
            for block in structure.blocks() {
                pieces.push(ChunkPiece {
                    build: *block,
                    guid: *guid,
                    chunk_offset,
                });
                chunk_offset += block.size;
            }
        }
        pieces.sort_by_key(|p| p.build.offset);
        pieces
    }

    fn check_coverage(&self) -> Result<()> {
        let expected = (self.build_size > 0).then(|| Block::new(0, self.build_size));
        if self.all_chunk_matches.single_block() != expected {
            bail!(
                "chunk matches do not cover the build image [0, {}) exactly: {:?}",
                self.build_size,
                self.all_chunk_matches.blocks()
            );
        }
        Ok(())
    }

    /// Computes every file's chunk parts and keeps only the referenced chunk infos.
    pub fn finalize_data(&mut self, file_spans: &[FileSpan], chunk_infos: Vec<FChunkInfo>) -> Result<()> {
        let mut filenames = HashSet::new();
        if let Some(span) = file_spans.iter().find(|s| !filenames.insert(s.filename.as_str())) {
            bail!("file {:?} is listed more than once", span.filename);
        }
        let pieces = self.pieces();
        self.build_size = file_spans.iter().map(FileSpan::end).max().unwrap_or(0);

        let mut file_list = Vec::with_capacity(file_spans.len());
        let mut referenced = HashSet::new();
        for span in file_spans {
            let mut chunk_parts = vec![];
            let first = pieces.partition_point(|p| p.build.end() <= span.start_idx);
            for piece in pieces[first..].iter().take_while(|p| p.build.offset < span.end()) {
                let start = piece.build.offset.max(span.start_idx);
                let end = piece.build.end().min(span.end());
                let offset = piece.chunk_offset + (start - piece.build.offset);
                chunk_parts.push(FChunkPart {
                    guid: piece.guid,
                    offset: u32::try_from(offset).context("chunk part offset out of range")?,
                    size: u32::try_from(end - start).context("chunk part size out of range")?,
                });
                referenced.insert(piece.guid);
            }
            let mut file = FFileManifest {
                filename: span.filename.clone(),
                symlink_target: span.symlink_target.clone(),
                file_hash: span.sha_hash,
                file_meta_flags: span.meta_flags,
                install_tags: span.install_tags.clone(),
                chunk_parts,
                file_size: 0,
            };
            file.init();
            if file.file_size != span.size {
                bail!("file {:?} has {} bytes of chunk data, expected {}", span.filename, file.file_size, span.size);
            }
            file_list.push(file);
        }

        let chunk_list: Vec<FChunkInfo> = chunk_infos.into_iter().filter(|c| referenced.contains(&c.guid)).collect();
        let known: HashSet<FGuid> = chunk_list.iter().map(|c| c.guid).collect();
        if let Some(missing) = referenced.iter().find(|g| !known.contains(g)) {
            bail!("no chunk info provided for referenced chunk {missing}");
        }
        self.check_coverage()?;

        let details = &self.details;
        let mut meta = FManifestMeta {
            feature_level: details.feature_level,
            is_file_data: false,
            app_id: details.app_id,
            app_name: details.app_name.clone(),
            build_version: details.build_version.clone(),
            launch_exe: details.launch_exe.clone(),
            launch_command: details.launch_command.clone(),
            prereq_ids: details.prereq_ids.clone(),
            prereq_name: details.prereq_name.clone(),
            prereq_path: details.prereq_path.clone(),
            prereq_args: details.prereq_args.clone(),
            build_id: String::new(),
        };
        meta.build_id = details.build_id.clone().unwrap_or_else(|| meta.runtime_build_id());

        let mut file_manifest_list = FFileManifestList { file_list };
        file_manifest_list.on_post_load();
        self.data = Some(FManifestData {
            meta,
            chunk_data_list: FChunkDataList { chunk_list },
            file_manifest_list,
            custom_fields: FCustomFields {
                fields: details.custom_fields.clone(),
            },
        });
        Ok(())
    }

    pub fn build(&self) -> Result<BuildPatchAppManifest> {
        let data = self.data.clone().context("manifest data has not been finalized")?;
        BuildPatchAppManifest::new(data)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.check_coverage()?;
        self.build()?.save_to_file(path, self.details.feature_level)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manifest_data::test::{chunk, guid};
    use pretty_assertions::assert_eq;

    fn span(filename: &str, start_idx: u64, size: u64) -> FileSpan {
        FileSpan {
            filename: filename.into(),
            start_idx,
            size,
            sha_hash: FSHAHash::from_data(filename.as_bytes()),
            ..Default::default()
        }
    }

    fn details() -> ManifestDetails {
        ManifestDetails {
            feature_level: EFeatureLevel::LATEST,
            app_name: "Builder".into(),
            build_version: "1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_two_files_three_chunks() -> Result<()> {
        let mut builder = ManifestBuilder::new(details());
        builder.add_chunk_match(guid(1), BlockStructure::from_block(0, 100));
        builder.add_chunk_match(guid(2), BlockStructure::from_block(100, 150));
        builder.add_chunk_match(guid(3), BlockStructure::from_block(250, 50));
        let infos = vec![chunk(1, 10), chunk(2, 10), chunk(3, 10), chunk(4, 10)];
        builder.finalize_data(&[span("b.bin", 120, 180), span("a.bin", 0, 120)], infos)?;

        let manifest = builder.build()?;
        assert_eq!(vec!["a.bin", "b.bin"], manifest.file_list());
        assert_eq!(
            vec![FChunkPart::new(guid(1), 0, 100), FChunkPart::new(guid(2), 0, 20)],
            manifest.file_manifest("a.bin").unwrap().chunk_parts
        );
        assert_eq!(
            vec![FChunkPart::new(guid(2), 20, 130), FChunkPart::new(guid(3), 0, 50)],
            manifest.file_manifest("b.bin").unwrap().chunk_parts
        );
        // unreferenced chunk info is pruned
        assert_eq!(vec![guid(1), guid(2), guid(3)], manifest.data_list());
        assert_eq!(300, manifest.build_size());

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("built.manifest");
        builder.save_to_file(&path)?;
        assert_eq!(manifest, BuildPatchAppManifest::load_from_file(&path)?);
        Ok(())
    }

    #[test]
    fn test_multi_block_match() -> Result<()> {
        let mut builder = ManifestBuilder::new(details());
        let mut split = BlockStructure::new();
        split.add(0, 30);
        split.add(60, 40);
        builder.add_chunk_match(guid(1), split);
        builder.add_chunk_match(guid(2), BlockStructure::from_block(30, 30));
        builder.finalize_data(&[span("only.bin", 0, 100)], vec![chunk(1, 1), chunk(2, 1)])?;
        let manifest = builder.build()?;
        assert_eq!(
            vec![FChunkPart::new(guid(1), 0, 30), FChunkPart::new(guid(2), 0, 30), FChunkPart::new(guid(1), 30, 40)],
            manifest.file_manifest("only.bin").unwrap().chunk_parts
        );
        Ok(())
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn test_overlapping_match_panics() {
        let mut builder = ManifestBuilder::new(details());
        builder.add_chunk_match(guid(1), BlockStructure::from_block(0, 100));
        builder.add_chunk_match(guid(2), BlockStructure::from_block(99, 10));
    }

    #[test]
    fn test_gap_is_rejected() {
        let mut builder = ManifestBuilder::new(details());
        builder.add_chunk_match(guid(1), BlockStructure::from_block(0, 100));
        builder.add_chunk_match(guid(2), BlockStructure::from_block(150, 50));
        let err = builder
            .finalize_data(&[span("a.bin", 0, 100), span("b.bin", 150, 50)], vec![chunk(1, 1), chunk(2, 1)])
            .unwrap_err();
        assert!(err.to_string().contains("do not cover"));
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_missing_chunk_info_is_rejected() {
        let mut builder = ManifestBuilder::new(details());
        builder.add_chunk_match(guid(1), BlockStructure::from_block(0, 100));
        let err = builder.finalize_data(&[span("a.bin", 0, 100)], vec![chunk(2, 1)]).unwrap_err();
        assert!(err.to_string().contains("no chunk info"));
    }

    #[test]
    fn test_duplicate_filename_is_rejected() {
        let mut builder = ManifestBuilder::new(details());
        builder.add_chunk_match(guid(1), BlockStructure::from_block(0, 100));
        let err = builder
            .finalize_data(&[span("a.bin", 0, 50), span("a.bin", 50, 50)], vec![chunk(1, 1)])
            .unwrap_err();
        assert!(err.to_string().contains("more than once"), "{err:#}");
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_file_size_mismatch_is_rejected() {
        let mut builder = ManifestBuilder::new(details());
        builder.add_chunk_match(guid(1), BlockStructure::from_block(0, 50));
        // second half of the file has no chunk data
        let err = builder.finalize_data(&[span("a.bin", 0, 100)], vec![chunk(1, 1)]).unwrap_err();
        assert!(err.to_string().contains("expected 100"));
    }
}
