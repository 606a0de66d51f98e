//! ST-011: ImageStore — machine images and instance power state.
//!
//! Tag-based image lookup is the cache-read side of incremental builds:
//! exactly one image may carry a given tag set, otherwise selection would
//! be unsound.

use crate::cloud::ComputeApi;
use crate::core::error::{Error, Result};
use crate::core::types::{ImageState, InstanceState, Tags};

pub struct ImageStore<A: ComputeApi> {
    api: A,
}

impl<A: ComputeApi> ImageStore<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    /// The unique image carrying this tag set. `None` when absent;
    /// `AmbiguousMatch` when more than one matches.
    pub fn find_image(&self, tags: &Tags) -> Result<Option<String>> {
        let mut matches = self.api.find_images(tags)?;
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.remove(0))),
            _ => Err(Error::AmbiguousMatch(
                tags.iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(","),
            )),
        }
    }

    pub fn instance_state(&self, instance_id: &str) -> Result<InstanceState> {
        self.api.instance_state(instance_id)
    }

    pub fn stop_instance(&self, instance_id: &str) -> Result<()> {
        tracing::debug!(instance = instance_id, "stopping instance");
        self.api.stop_instance(instance_id)
    }

    /// Snapshot a stopped instance into a new tagged image.
    pub fn create_image(
        &self,
        instance_id: &str,
        name: &str,
        description: &str,
        tags: &Tags,
    ) -> Result<String> {
        // Snapshotting a live instance would capture an inconsistent disk
        if self.api.instance_state(instance_id)? != InstanceState::Stopped {
            return Err(Error::Remote(format!(
                "refusing to create image from non-stopped instance {}",
                instance_id
            )));
        }
        tracing::info!(instance = instance_id, image = name, "creating image");
        self.api.create_image(instance_id, name, description, tags)
    }

    pub fn image_state(&self, image_id: &str) -> Result<ImageState> {
        self.api.image_state(image_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::sim::SimCloud;
    use crate::core::types::{TAG_BASE_AMI, TAG_STATUS_ID};

    fn tags(base: &str, status: &str) -> Tags {
        Tags::from([
            (TAG_BASE_AMI.to_string(), base.to_string()),
            (TAG_STATUS_ID.to_string(), status.to_string()),
        ])
    }

    #[test]
    fn test_st011_find_image_none() {
        let sim = SimCloud::new();
        let store = ImageStore::new(&sim);
        assert_eq!(store.find_image(&tags("ami-1", "st-a")).unwrap(), None);
    }

    #[test]
    fn test_st011_find_image_unique() {
        let sim = SimCloud::new();
        let id = sim.seed_image(&tags("ami-1", "st-a"));
        let store = ImageStore::new(&sim);
        assert_eq!(
            store.find_image(&tags("ami-1", "st-a")).unwrap(),
            Some(id)
        );
    }

    #[test]
    fn test_st011_find_image_ambiguous() {
        let sim = SimCloud::new();
        sim.seed_image(&tags("ami-1", "st-a"));
        sim.seed_image(&tags("ami-1", "st-a"));
        let store = ImageStore::new(&sim);
        let err = store.find_image(&tags("ami-1", "st-a")).unwrap_err();
        assert!(matches!(err, Error::AmbiguousMatch(_)));
    }

    #[test]
    fn test_st011_find_image_superset_tags_match() {
        let sim = SimCloud::new();
        let mut extra = tags("ami-1", "st-a");
        extra.insert("stratus:last-phase".to_string(), "app".to_string());
        let id = sim.seed_image(&extra);
        let store = ImageStore::new(&sim);
        // Predicate is a subset of the image's tags
        assert_eq!(
            store.find_image(&tags("ami-1", "st-a")).unwrap(),
            Some(id)
        );
    }

    #[test]
    fn test_st011_create_image_requires_stopped() {
        let sim = SimCloud::new();
        let instance = sim.seed_instance(InstanceState::Running);
        let store = ImageStore::new(&sim);
        let err = store
            .create_image(&instance, "img", "", &tags("ami-1", "st-a"))
            .unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
    }

    #[test]
    fn test_st011_create_image_from_stopped() {
        let sim = SimCloud::new();
        let instance = sim.seed_instance(InstanceState::Stopped);
        let store = ImageStore::new(&sim);
        let image = store
            .create_image(&instance, "img", "built by test", &tags("ami-1", "st-a"))
            .unwrap();
        assert_eq!(store.image_state(&image).unwrap(), ImageState::Pending);
        sim.settle();
        assert_eq!(store.image_state(&image).unwrap(), ImageState::Available);
        // The new image is findable by its tags
        assert_eq!(
            store.find_image(&tags("ami-1", "st-a")).unwrap(),
            Some(image)
        );
    }

    #[test]
    fn test_st011_stop_instance_transitions() {
        let sim = SimCloud::new();
        let instance = sim.seed_instance(InstanceState::Running);
        let store = ImageStore::new(&sim);
        store.stop_instance(&instance).unwrap();
        assert_eq!(
            store.instance_state(&instance).unwrap(),
            InstanceState::Stopping
        );
        sim.settle();
        assert_eq!(
            store.instance_state(&instance).unwrap(),
            InstanceState::Stopped
        );
    }
}
