//! ST-001: Data model — phases, status ids, launchables, build candidates.
//!
//! A status id names the cumulative effect of a phase prefix: the empty
//! prefix is the base image (empty id), every longer prefix gets a chained
//! BLAKE3 identity over phase names and inline scripts. Images carry their
//! status id as a tag, which is what makes prefix-cache lookups and
//! crash resumption possible without any local state.

use crate::core::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of build stacks launched concurrently.
pub const ADMISSION_CAP: usize = 8;

/// Tag keys used for discovery on remote stacks and images.
pub const TAG_OWNER: &str = "stratus:owner";
pub const TAG_BASE_AMI: &str = "stratus:base-ami";
pub const TAG_TARGET_ID: &str = "stratus:target-id";
pub const TAG_STATUS_ID: &str = "stratus:status-id";
pub const TAG_LAST_PHASE: &str = "stratus:last-phase";

/// Sorted tag map; the sole association mechanism between local intent and
/// remote artifacts.
pub type Tags = BTreeMap<String, String>;

/// Build the two-entry discovery tag set for a (base image, target) pair.
pub fn discovery_tags(base_ami: &str, target_id: &str) -> Tags {
    Tags::from([
        (TAG_BASE_AMI.to_string(), base_ami.to_string()),
        (TAG_TARGET_ID.to_string(), target_id.to_string()),
    ])
}

// ============================================================================
// Phases
// ============================================================================

/// A named, ordered provisioning step. Phases are cumulative: running
/// `[p1..pn]` on a base image yields a distinct image identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// Phase name (unique within a launchable)
    pub name: String,

    /// Inline provisioning script, templatable with `{{var}}`
    #[serde(default)]
    pub run: Option<String>,
}

impl Phase {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            run: None,
        }
    }
}

/// Status id of a phase prefix. Empty prefix → empty string (the base
/// image itself). Chained so that every prefix length yields a distinct,
/// stable identity.
pub fn status_id(phases: &[Phase]) -> String {
    if phases.is_empty() {
        return String::new();
    }
    let mut hasher = blake3::Hasher::new();
    for phase in phases {
        hasher.update(phase.name.as_bytes());
        hasher.update(b"\0");
        if let Some(ref run) = phase.run {
            hasher.update(run.as_bytes());
        }
        hasher.update(b"\n");
    }
    format!("st-{}", &hasher.finalize().to_hex().as_str()[..16])
}

// ============================================================================
// Launchables
// ============================================================================

/// A provisionable resource: a base image per region, an ordered phase list,
/// and whether it supports being baked into an image at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Launchable {
    /// Base image id per region
    #[serde(default)]
    pub base_image: IndexMap<String, String>,

    /// Whether this launchable can be built into an image
    #[serde(default = "default_true")]
    pub buildable: bool,

    /// Instance type for build and run stacks
    #[serde(default)]
    pub instance_type: Option<String>,

    /// Ordered provisioning phases
    #[serde(default)]
    pub phases: Vec<Phase>,
}

fn default_true() -> bool {
    true
}

impl Launchable {
    /// Resolve the base image for a region.
    pub fn base_image_for(&self, name: &str, region: &str) -> Result<&str> {
        self.base_image
            .get(region)
            .map(String::as_str)
            .ok_or_else(|| Error::NoBaseImage {
                launchable: name.to_string(),
                region: region.to_string(),
            })
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// What a resolution is for: launching instances now, or baking images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Pick the best existing image; residual phases run at launch time.
    Run,
    /// Enumerate incremental targets still missing an image.
    Build {
        /// Build only the next incremental target instead of the full prefix
        next_only: bool,
    },
}

/// One entry in the ordered result of resolving a launchable.
#[derive(Debug, Clone)]
pub struct BuildCandidate {
    /// Base image for the target region
    pub base_ami: String,

    /// Status id of the covered prefix (empty = base image, nothing baked)
    pub status_id: String,

    /// Phases already baked into `image`
    pub covered: Vec<Phase>,

    /// Image to launch from: the longest-prefix match, or the base image
    pub image: String,

    /// Build target id (status id of the target prefix); None for RUN
    pub target_id: Option<String>,

    /// Phases still to run (to reach the target, or at launch time)
    pub remaining: Vec<Phase>,
}

// ============================================================================
// Remote state enums
// ============================================================================

/// Stack lifecycle status as observed from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    Creating,
    Created,
    Failed,
    RollingBack,
    Deleting,
    Deleted,
}

impl StackStatus {
    pub fn is_being_created(self) -> bool {
        matches!(self, Self::Creating)
    }

    pub fn is_created(self) -> bool {
        matches!(self, Self::Created)
    }

    pub fn is_failed_or_rolled_back(self) -> bool {
        matches!(self, Self::Failed | Self::RollingBack)
    }

    pub fn is_being_deleted(self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted)
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "CREATING"),
            Self::Created => write!(f, "CREATED"),
            Self::Failed => write!(f, "FAILED"),
            Self::RollingBack => write!(f, "ROLLING_BACK"),
            Self::Deleting => write!(f, "DELETING"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Compute instance power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

/// Machine image availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Pending,
    Available,
    Failed,
}

// ============================================================================
// Build outcomes
// ============================================================================

/// Terminal result of a single build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Ok,
    Failed,
}

impl fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Final report for one driven job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub target_id: String,
    pub launchable: String,
    pub image_id: Option<String>,
    pub outcome: BuildOutcome,
}

/// Summary of a full driver run; the loop never aborts early on one job's
/// failure, so every enqueued job appears here.
#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    pub reports: Vec<JobReport>,
}

impl BuildSummary {
    pub fn succeeded(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome == BuildOutcome::Ok)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome == BuildOutcome::Failed)
            .count()
    }

    pub fn all_ok(&self) -> bool {
        self.failed() == 0
    }
}
