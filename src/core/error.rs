//! ST-002: Error taxonomy for stack reconciliation and image builds.
//!
//! Build failures are not errors: a remote resource entering a failure state
//! is recorded as the job's outcome and the driver loop keeps going. Errors
//! here abort the current invocation.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Stack exists and updates were not permitted. Fatal, never retried.
    #[error("stack '{0}' already exists and updates are not allowed")]
    Conflict(String),

    /// Transport or provider failure. Not retried inside a step; the next
    /// driver iteration re-enters the same state.
    #[error("provider error: {0}")]
    Remote(String),

    /// More than one image matched the same tag set; automatic selection
    /// would be unsound.
    #[error("more than one image matches tags [{0}]")]
    AmbiguousMatch(String),

    /// Launchable has no base image registered for the target region.
    #[error("launchable '{launchable}' has no base image for region '{region}'")]
    NoBaseImage { launchable: String, region: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(String),

    /// A build job observed state its current machine state cannot hold.
    #[error("build job '{target_id}': {reason}")]
    Job { target_id: String, reason: String },
}

impl Error {
    /// Shorthand for state-machine invariant breaches.
    pub fn job(target_id: &str, reason: impl Into<String>) -> Self {
        Self::Job {
            target_id: target_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_st002_conflict_display() {
        let e = Error::Conflict("web".to_string());
        assert_eq!(
            e.to_string(),
            "stack 'web' already exists and updates are not allowed"
        );
    }

    #[test]
    fn test_st002_no_base_image_display() {
        let e = Error::NoBaseImage {
            launchable: "app".to_string(),
            region: "eu-west-1".to_string(),
        };
        assert!(e.to_string().contains("app"));
        assert!(e.to_string().contains("eu-west-1"));
    }

    #[test]
    fn test_st002_job_shorthand() {
        let e = Error::job("st-abc", "no stack handle");
        assert_eq!(e.to_string(), "build job 'st-abc': no stack handle");
    }
}
