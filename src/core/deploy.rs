//! ST-008: Deploy driver — application stacks from resolved launchables.
//!
//! RUN-purpose resolution picks the best baked image per launchable; the
//! residual phases are handed to the instance to run at boot. Whatever the
//! build orchestrator has not baked yet still deploys, just slower.

use crate::cloud::images::ImageStore;
use crate::cloud::reconciler::{Reconciler, StackHandle};
use crate::cloud::{ComputeApi, StackApi};
use crate::core::error::Result;
use crate::core::resolver::resolve;
use crate::core::template::TemplateEngine;
use crate::core::types::{Launchable, Phase, Purpose, Tags, TAG_OWNER};
use indexmap::IndexMap;

/// How one launchable will be brought up: the image to boot and the phases
/// left to run at launch time.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub launchable: String,
    pub image: String,
    pub covered: usize,
    pub at_launch: Vec<Phase>,
}

/// Resolve every launchable of a stack for launching. Pure planning; no
/// stacks are touched.
pub fn plan_launch<C: ComputeApi>(
    launchables: &IndexMap<String, Launchable>,
    region: &str,
    images: &ImageStore<C>,
) -> Result<Vec<LaunchSpec>> {
    let mut specs = Vec::with_capacity(launchables.len());
    for (name, launchable) in launchables {
        let mut candidates = resolve(name, launchable, region, Purpose::Run, images)?;
        let candidate = candidates.remove(0);
        specs.push(LaunchSpec {
            launchable: name.clone(),
            image: candidate.image,
            covered: candidate.covered.len(),
            at_launch: candidate.remaining,
        });
    }
    Ok(specs)
}

/// Creates and tears down application stacks.
pub struct Deployer<A: StackApi, C: ComputeApi, E: TemplateEngine> {
    reconciler: Reconciler<A>,
    images: ImageStore<C>,
    engine: E,
    owner: String,
}

impl<A: StackApi, C: ComputeApi, E: TemplateEngine> Deployer<A, C, E> {
    pub fn new(reconciler: Reconciler<A>, images: ImageStore<C>, engine: E, owner: &str) -> Self {
        Self {
            reconciler,
            images,
            engine,
            owner: owner.to_string(),
        }
    }

    /// Render the application stack for the current image cache.
    pub fn definition(
        &self,
        stack_name: &str,
        launchables: &IndexMap<String, Launchable>,
        region: &str,
    ) -> Result<crate::core::template::StackDefinition> {
        let mut instances = Vec::with_capacity(launchables.len());
        for spec in plan_launch(launchables, region, &self.images)? {
            let launchable = &launchables[&spec.launchable];
            instances.push((
                spec.launchable,
                launchable.clone(),
                spec.image,
                spec.at_launch,
            ));
        }
        self.engine.make_app_stack(stack_name, &instances)
    }

    /// Create the stack, or update it in place when `allow_update` is set.
    pub fn deploy(
        &self,
        stack_name: &str,
        launchables: &IndexMap<String, Launchable>,
        region: &str,
        allow_update: bool,
    ) -> Result<StackHandle> {
        let definition = self.definition(stack_name, launchables, region)?;
        let tags = Tags::from([(TAG_OWNER.to_string(), self.owner.clone())]);
        self.reconciler
            .create_or_update(&definition, stack_name, &tags, allow_update)
    }

    /// Tear the stack down. Deleting a stack that is not deployed is a no-op.
    pub fn undeploy(&self, stack_name: &str) -> Result<()> {
        self.reconciler.delete(&StackHandle {
            id: stack_name.to_string(),
            name: stack_name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::sim::SimCloud;
    use crate::core::error::Error;
    use crate::core::template::BuiltinTemplates;
    use crate::core::types::{status_id, TAG_BASE_AMI, TAG_STATUS_ID};

    const REGION: &str = "us-east-1";

    fn launchables() -> IndexMap<String, Launchable> {
        IndexMap::from([
            (
                "app".to_string(),
                Launchable {
                    base_image: IndexMap::from([(REGION.to_string(), "ami-app".to_string())]),
                    buildable: true,
                    instance_type: None,
                    phases: vec![Phase::named("base"), Phase::named("app")],
                },
            ),
            (
                "db".to_string(),
                Launchable {
                    base_image: IndexMap::from([(REGION.to_string(), "ami-db".to_string())]),
                    buildable: false,
                    instance_type: Some("m1.large".to_string()),
                    phases: vec![Phase::named("db")],
                },
            ),
        ])
    }

    fn deployer(sim: &SimCloud) -> Deployer<&SimCloud, &SimCloud, BuiltinTemplates> {
        Deployer::new(
            Reconciler::new(sim, "store"),
            ImageStore::new(sim),
            BuiltinTemplates,
            "test",
        )
    }

    #[test]
    fn test_st008_plan_uses_cached_image() {
        let sim = SimCloud::new();
        let ls = launchables();
        let baked = sim.seed_image(&Tags::from([
            (TAG_BASE_AMI.to_string(), "ami-app".to_string()),
            (
                TAG_STATUS_ID.to_string(),
                status_id(&ls["app"].phases[..1]),
            ),
        ]));

        let specs = plan_launch(&ls, REGION, &ImageStore::new(&sim)).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].image, baked);
        assert_eq!(specs[0].covered, 1);
        assert_eq!(specs[0].at_launch.len(), 1);
        // Non-buildable launchable always boots its base image
        assert_eq!(specs[1].image, "ami-db");
        assert_eq!(specs[1].at_launch.len(), 1);
    }

    #[test]
    fn test_st008_deploy_renders_one_instance_per_launchable() {
        let sim = SimCloud::new();
        let d = deployer(&sim);
        d.deploy("web", &launchables(), REGION, false).unwrap();
        sim.settle();

        let template = sim.get_template("web").unwrap();
        let resources = template["Resources"].as_object().unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources["app"]["Properties"]["ImageId"], "ami-app");
        assert_eq!(resources["db"]["Properties"]["InstanceType"], "m1.large");
    }

    #[test]
    fn test_st008_redeploy_requires_update_flag() {
        let sim = SimCloud::new();
        let d = deployer(&sim);
        d.deploy("web", &launchables(), REGION, false).unwrap();

        let err = d.deploy("web", &launchables(), REGION, false).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(d.deploy("web", &launchables(), REGION, true).is_ok());
    }

    #[test]
    fn test_st008_undeploy_is_idempotent() {
        let sim = SimCloud::new();
        let d = deployer(&sim);
        d.deploy("web", &launchables(), REGION, false).unwrap();
        sim.settle();
        d.undeploy("web").unwrap();
        sim.settle();
        // Already gone; still fine
        d.undeploy("web").unwrap();
        assert_eq!(sim.delete_calls("web"), 1);
    }
}
