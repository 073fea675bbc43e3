//! Optimised deltas are small server side manifests listing better chunk parts for moving from
//! one specific build to another. They are stored next to the manifests under
//! `Deltas/<destination build id>/<source build id>.delta`.

use anyhow::{Context as _, Result, bail};

use crate::logging::*;
use crate::merge_manifests::merge_delta_manifest;
use crate::{BuildPatchAppManifest, DataFetcher, EFeatureLevel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DeltaPolicy {
    /// Never look for a delta.
    Skip,
    /// Use a delta if one can be fetched, carry on with the plain destination otherwise.
    #[default]
    TryFetchContinueWithout,
    /// Fail unless a delta is fetched.
    Expect,
}

pub fn delta_filename(source: &BuildPatchAppManifest, destination: &BuildPatchAppManifest) -> String {
    format!("Deltas/{}/{}.delta", destination.build_id(), source.build_id())
}

/// The manifest to install when moving from `source` to `destination`.
#[derive(Debug, Clone)]
pub struct OptimisedDelta {
    pub manifest: BuildPatchAppManifest,
    /// Bytes downloaded for the delta file itself.
    pub meta_download_size: u64,
}

fn fetch_delta(fetcher: &dyn DataFetcher, path: &str) -> Result<Option<(BuildPatchAppManifest, u64)>> {
    let Some(bytes) = fetcher.fetch_opt(path)? else {
        return Ok(None);
    };
    let delta = BuildPatchAppManifest::deserialize_from_data(&bytes).with_context(|| format!("invalid optimised delta {path}"))?;
    Ok(Some((delta, bytes.len() as u64)))
}

pub fn get_optimised_delta(
    fetcher: &dyn DataFetcher,
    source: &BuildPatchAppManifest,
    destination: &BuildPatchAppManifest,
    policy: DeltaPolicy,
    log: &Log,
) -> Result<OptimisedDelta> {
    let plain = || OptimisedDelta {
        manifest: destination.clone(),
        meta_download_size: 0,
    };
    if policy == DeltaPolicy::Skip
        || destination.feature_level() < EFeatureLevel::FIRST_OPTIMISED_DELTA
        || source.build_id() == destination.build_id()
    {
        return Ok(plain());
    }

    let path = delta_filename(source, destination);
    let fetched = match fetch_delta(fetcher, &path) {
        Ok(Some((delta, size))) => merge_delta_manifest(destination, &delta).map(|merged| Some((merged, size))),
        other => other,
    };
    match (fetched, policy) {
        (Ok(Some((manifest, meta_download_size))), _) => {
            verbose!(log, "using optimised delta {path} ({meta_download_size} bytes)");
            Ok(OptimisedDelta {
                manifest,
                meta_download_size,
            })
        }
        (Ok(None), DeltaPolicy::Expect) => bail!("optimised delta {path} not found"),
        (Err(err), DeltaPolicy::Expect) => Err(err.context(format!("failed to get optimised delta {path}"))),
        (Ok(None), _) => {
            debug!(log, "no optimised delta at {path}");
            Ok(plain())
        }
        (Err(err), _) => {
            warning!(log, "ignoring optimised delta {path}: {err:#}");
            Ok(plain())
        }
    }
}
