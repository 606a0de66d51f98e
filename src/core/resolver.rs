//! ST-005: Greedy image resolution.
//!
//! Given a launchable and a region, find the image covering the longest
//! phase prefix already baked, then express what is left either as phases
//! to run at launch time (RUN) or as the next incremental build target
//! (BUILD). The search is remote-only: the image tag set is the cache.

use crate::cloud::images::ImageStore;
use crate::cloud::ComputeApi;
use crate::core::error::Result;
use crate::core::types::{
    status_id, BuildCandidate, Launchable, Purpose, Tags, TAG_BASE_AMI, TAG_STATUS_ID,
};

/// Longest phase prefix of `launchable` for which a baked image exists.
/// Returns the prefix length and the image id; length 0 means nothing is
/// baked and the base image itself is the starting point.
fn longest_cached_prefix<C: ComputeApi>(
    launchable: &Launchable,
    base_ami: &str,
    images: &ImageStore<C>,
) -> Result<(usize, Option<String>)> {
    for k in (1..=launchable.phases.len()).rev() {
        let tags = Tags::from([
            (TAG_BASE_AMI.to_string(), base_ami.to_string()),
            (
                TAG_STATUS_ID.to_string(),
                status_id(&launchable.phases[..k]),
            ),
        ]);
        if let Some(image) = images.find_image(&tags)? {
            return Ok((k, Some(image)));
        }
    }
    Ok((0, None))
}

/// Resolve a launchable against the image cache for the given purpose.
///
/// RUN always yields exactly one candidate: launch from the best image and
/// run the residual phases at boot. BUILD yields at most one candidate, the
/// next target still missing an image; an empty result means the launchable
/// is fully baked (or not buildable at all).
pub fn resolve<C: ComputeApi>(
    name: &str,
    launchable: &Launchable,
    region: &str,
    purpose: Purpose,
    images: &ImageStore<C>,
) -> Result<Vec<BuildCandidate>> {
    let base_ami = launchable.base_image_for(name, region)?.to_string();
    let (covered_len, cached) = longest_cached_prefix(launchable, &base_ami, images)?;
    let covered = launchable.phases[..covered_len].to_vec();
    let image = cached.unwrap_or_else(|| base_ami.clone());

    match purpose {
        Purpose::Run => Ok(vec![BuildCandidate {
            base_ami,
            status_id: status_id(&covered),
            covered,
            image,
            target_id: None,
            remaining: launchable.phases[covered_len..].to_vec(),
        }]),
        Purpose::Build { next_only } => {
            if !launchable.buildable || covered_len == launchable.phases.len() {
                return Ok(Vec::new());
            }
            let target_len = if next_only {
                covered_len + 1
            } else {
                launchable.phases.len()
            };
            Ok(vec![BuildCandidate {
                base_ami,
                status_id: status_id(&covered),
                covered,
                image,
                target_id: Some(status_id(&launchable.phases[..target_len])),
                remaining: launchable.phases[covered_len..target_len].to_vec(),
            }])
        }
    }
}
