//! ST-009: Provider interface — the seam to the cloud SDK.
//!
//! The reconciler and image store are thin semantic layers over these two
//! traits. Real SDK bindings implement them outside this crate; the built-in
//! `sim` provider (cloud::sim) implements them in memory.

pub mod images;
pub mod reconciler;
pub mod sim;

use crate::core::error::{Error, Result};
use crate::core::parser::TargetConfig;
use crate::core::types::{ImageState, InstanceState, StackStatus, Tags};
use std::time::{Duration, Instant};

/// Raw stack and blob-storage operations.
pub trait StackApi {
    fn create_stack(&self, name: &str, template_url: &str, tags: &Tags) -> Result<String>;
    fn update_stack(&self, name: &str, template_url: &str) -> Result<String>;
    fn delete_stack(&self, name: &str) -> Result<()>;
    /// None when no stack with that name or id exists at all.
    fn describe_stack(&self, name_or_id: &str) -> Result<Option<StackDescription>>;
    fn list_stacks(&self) -> Result<Vec<StackDescription>>;
    fn describe_stack_resources(&self, name_or_id: &str) -> Result<Vec<StackResource>>;
    /// Deployed template body, for diffing.
    fn get_template(&self, name_or_id: &str) -> Result<serde_json::Value>;
    /// Upload a rendered template body; returns its URL.
    fn upload_template(&self, key: &str, body: &str) -> Result<String>;
}

/// Raw compute and image operations.
pub trait ComputeApi {
    fn instance_state(&self, instance_id: &str) -> Result<InstanceState>;
    fn stop_instance(&self, instance_id: &str) -> Result<()>;
    fn create_image(
        &self,
        instance_id: &str,
        name: &str,
        description: &str,
        tags: &Tags,
    ) -> Result<String>;
    fn image_state(&self, image_id: &str) -> Result<ImageState>;
    /// All image ids whose tags are a superset of the given set.
    fn find_images(&self, tags: &Tags) -> Result<Vec<String>>;
}

impl<T: StackApi + ?Sized> StackApi for &T {
    fn create_stack(&self, name: &str, template_url: &str, tags: &Tags) -> Result<String> {
        (**self).create_stack(name, template_url, tags)
    }
    fn update_stack(&self, name: &str, template_url: &str) -> Result<String> {
        (**self).update_stack(name, template_url)
    }
    fn delete_stack(&self, name: &str) -> Result<()> {
        (**self).delete_stack(name)
    }
    fn describe_stack(&self, name_or_id: &str) -> Result<Option<StackDescription>> {
        (**self).describe_stack(name_or_id)
    }
    fn list_stacks(&self) -> Result<Vec<StackDescription>> {
        (**self).list_stacks()
    }
    fn describe_stack_resources(&self, name_or_id: &str) -> Result<Vec<StackResource>> {
        (**self).describe_stack_resources(name_or_id)
    }
    fn get_template(&self, name_or_id: &str) -> Result<serde_json::Value> {
        (**self).get_template(name_or_id)
    }
    fn upload_template(&self, key: &str, body: &str) -> Result<String> {
        (**self).upload_template(key, body)
    }
}

impl<T: ComputeApi + ?Sized> ComputeApi for &T {
    fn instance_state(&self, instance_id: &str) -> Result<InstanceState> {
        (**self).instance_state(instance_id)
    }
    fn stop_instance(&self, instance_id: &str) -> Result<()> {
        (**self).stop_instance(instance_id)
    }
    fn create_image(
        &self,
        instance_id: &str,
        name: &str,
        description: &str,
        tags: &Tags,
    ) -> Result<String> {
        (**self).create_image(instance_id, name, description, tags)
    }
    fn image_state(&self, image_id: &str) -> Result<ImageState> {
        (**self).image_state(image_id)
    }
    fn find_images(&self, tags: &Tags) -> Result<Vec<String>> {
        (**self).find_images(tags)
    }
}

/// Remote stack as described by the provider.
#[derive(Debug, Clone)]
pub struct StackDescription {
    pub id: String,
    pub name: String,
    pub status: StackStatus,
    pub tags: Tags,
}

/// One resource inside a stack.
#[derive(Debug, Clone)]
pub struct StackResource {
    pub logical_id: String,
    pub resource_type: String,
    pub physical_id: String,
    pub status: String,
}

/// Minimum inter-call interval shared by every remote call, to stay under
/// provider throttling. One pacer serves all jobs: the pause is a shared
/// resource, not a per-job sleep.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// No pausing; for tests and the sim provider.
    pub fn unthrottled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Block until at least `interval` has passed since the previous call.
    pub fn pause(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

/// Resolve the provider binding named in the target config.
pub fn connect(target: &TargetConfig) -> Result<sim::SimCloud> {
    match target.provider.as_str() {
        "sim" => Ok(sim::SimCloud::new()),
        other => Err(Error::Config(format!(
            "unknown provider '{}' (only 'sim' is built in; SDK bindings implement StackApi/ComputeApi externally)",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_st009_pacer_unthrottled_is_instant() {
        let mut pacer = Pacer::unthrottled();
        let start = Instant::now();
        for _ in 0..100 {
            pacer.pause();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_st009_pacer_enforces_interval() {
        let mut pacer = Pacer::new(Duration::from_millis(20));
        pacer.pause();
        let start = Instant::now();
        pacer.pause();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_st009_connect_unknown_provider() {
        let target = TargetConfig {
            region: "us-east-1".to_string(),
            template_store: None,
            provider: "aws".to_string(),
        };
        assert!(connect(&target).is_err());
    }
}
