use std::io::{Read, Write};

use anyhow::{Context as _, Result, bail};
use strum::{FromRepr, IntoStaticStr, VariantArray};

use crate::ser::*;

/// Manifest format version. Each level adds a field or changes how the manifest is stored.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromRepr, IntoStaticStr, VariantArray)]
#[repr(u8)]
pub enum EFeatureLevel {
    #[default]
    Original = 0,
    CustomFields,
    StartStoringVersion,
    DataFileRenames,
    StoresIfChunkOrFileData,
    StoresDataGroupNumbers,
    ChunkCompressionSupport,
    StoresPrerequisitesInfo,
    StoresChunkFileSizes,
    StoredAsCompressedUClass,
    Unused0,
    Unused1,
    StoresChunkDataShaHashes,
    StoresPrerequisiteIds,
    StoredAsBinaryData,
    VariableSizeChunksWithoutWindowSizeChunkInfo,
    VariableSizeChunks,
    UsesRuntimeGeneratedBuildId,
    UsesBuildTimeGeneratedBuildId,
}

impl EFeatureLevel {
    pub const LATEST: Self = Self::UsesBuildTimeGeneratedBuildId;
    pub const LATEST_NO_CHUNKS: Self = Self::StoresChunkFileSizes;
    pub const LATEST_JSON: Self = Self::StoresPrerequisiteIds;
    pub const FIRST_OPTIMISED_DELTA: Self = Self::UsesRuntimeGeneratedBuildId;
    /// Value written by some tools into JSON manifests by mistake.
    pub const BROKEN_JSON_VERSION: i32 = 255;

    /// Rejects anything newer than [`Self::LATEST`].
    pub fn from_version(value: i32) -> Result<Self> {
        if value > Self::LATEST as i32 {
            bail!("manifest too new: feature level {value}, latest supported is {}", Self::LATEST as i32);
        }
        u8::try_from(value)
            .ok()
            .and_then(Self::from_repr)
            .with_context(|| format!("invalid EFeatureLevel value: {value}"))
    }

    pub fn is_binary(self) -> bool {
        self >= Self::StoredAsBinaryData
    }

    /// Cloud subdirectory holding chunk files for this feature level.
    pub fn chunk_subdir(self) -> &'static str {
        if self < Self::DataFileRenames {
            "Chunks"
        } else if self < Self::ChunkCompressionSupport {
            "ChunksV2"
        } else if self < Self::VariableSizeChunksWithoutWindowSizeChunkInfo {
            "ChunksV3"
        } else {
            "ChunksV4"
        }
    }
}

impl clap::ValueEnum for EFeatureLevel {
    fn value_variants<'a>() -> &'a [Self] {
        Self::VARIANTS
    }
    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        let name: &'static str = self.into();
        Some(clap::builder::PossibleValue::new(name))
    }
}

impl Readable for EFeatureLevel {
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Self::from_version(s.de::<u8>()? as i32)
    }
}
impl Writeable for EFeatureLevel {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&(*self as u8))
    }
}
