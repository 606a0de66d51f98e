//! ST-006: Stack definitions and the template engine boundary.
//!
//! A StackDefinition is an opaque JSON resource document the reconciler can
//! upload and diff; the engine trait is the seam to the external template
//! authoring layer. The built-in engine renders the minimal documents the
//! build orchestrator and deploy driver need: one instance per launchable
//! plus a completion-signal wait condition for build stacks.

use crate::core::error::{Error, Result};
use crate::core::types::{Launchable, Phase};
use serde_json::{json, Value};

/// Logical id of the compute instance in a build stack.
pub const BUILD_INSTANCE_LOGICAL_ID: &str = "BuildInstance";

/// Wait-condition timeout for a full provisioning run. Be generous with time.
const PROVISION_TIMEOUT_SECS: u32 = 3600;

/// A rendered stack template, ready to upload and diff.
#[derive(Debug, Clone)]
pub struct StackDefinition {
    body: Value,
}

impl StackDefinition {
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    fn properties_mut(&mut self, logical_id: &str) -> Result<&mut Value> {
        self.body
            .pointer_mut(&format!("/Resources/{}/Properties", logical_id))
            .ok_or_else(|| Error::Template(format!("no resource '{}' in definition", logical_id)))
    }

    /// Point a resource at a different machine image.
    pub fn set_image(&mut self, logical_id: &str, image_id: &str) -> Result<()> {
        self.properties_mut(logical_id)?["ImageId"] = json!(image_id);
        Ok(())
    }

    /// Override a resource's instance type.
    pub fn set_instance_type(&mut self, logical_id: &str, instance_type: &str) -> Result<()> {
        self.properties_mut(logical_id)?["InstanceType"] = json!(instance_type);
        Ok(())
    }

    /// Render the definition body for upload.
    pub fn render_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.body)
            .map_err(|e| Error::Template(format!("render failed: {}", e)))
    }
}

fn phases_json(phases: &[Phase]) -> Value {
    Value::Array(
        phases
            .iter()
            .map(|p| {
                json!({
                    "Name": p.name,
                    "Run": p.run,
                })
            })
            .collect(),
    )
}

fn instance_json(launchable: &Launchable, image: &str, phases: &[Phase]) -> Value {
    json!({
        "Type": "Cloud::Compute::Instance",
        "Properties": {
            "ImageId": image,
            "InstanceType": launchable.instance_type.as_deref().unwrap_or("m1.small"),
            "Phases": phases_json(phases),
        }
    })
}

/// Produces stack definitions; the external template-authoring layer
/// implements this for real resource graphs.
pub trait TemplateEngine {
    /// A standalone buildable stack: one instance running `phases` on
    /// `build_image`, plus a completion signal the orchestrator waits on.
    fn make_build_stack(
        &self,
        launchable_name: &str,
        launchable: &Launchable,
        build_image: &str,
        phases: &[Phase],
    ) -> Result<StackDefinition>;

    /// An application stack: one instance per launchable, already rewritten
    /// to its run image and residual phases.
    fn make_app_stack(
        &self,
        stack_name: &str,
        instances: &[(String, Launchable, String, Vec<Phase>)],
    ) -> Result<StackDefinition>;
}

/// Built-in minimal engine.
#[derive(Debug, Default)]
pub struct BuiltinTemplates;

impl TemplateEngine for BuiltinTemplates {
    fn make_build_stack(
        &self,
        launchable_name: &str,
        launchable: &Launchable,
        build_image: &str,
        phases: &[Phase],
    ) -> Result<StackDefinition> {
        let mut instance = instance_json(launchable, build_image, phases);
        instance["Properties"]["Signal"] = json!({ "Ref": "ProvisionCompleteHandle" });

        let body = json!({
            "Description": format!("stratus build stack for {}", launchable_name),
            "Resources": {
                BUILD_INSTANCE_LOGICAL_ID: instance,
                "ProvisionCompleteHandle": {
                    "Type": "Cloud::Signal::WaitConditionHandle"
                },
                "ProvisionComplete": {
                    "Type": "Cloud::Signal::WaitCondition",
                    "Properties": {
                        "Handle": { "Ref": "ProvisionCompleteHandle" },
                        "Timeout": PROVISION_TIMEOUT_SECS.to_string(),
                    }
                }
            },
            "Outputs": {
                "ProvisionData": {
                    "Description": "Output provided by the provisioning run",
                    "Value": { "Fn::GetAtt": ["ProvisionComplete", "Data"] }
                }
            }
        });
        Ok(StackDefinition::new(body))
    }

    fn make_app_stack(
        &self,
        stack_name: &str,
        instances: &[(String, Launchable, String, Vec<Phase>)],
    ) -> Result<StackDefinition> {
        let mut resources = serde_json::Map::new();
        for (name, launchable, image, phases) in instances {
            resources.insert(name.clone(), instance_json(launchable, image, phases));
        }
        let body = json!({
            "Description": format!("stratus stack {}", stack_name),
            "Resources": Value::Object(resources),
        });
        Ok(StackDefinition::new(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn launchable() -> Launchable {
        Launchable {
            base_image: IndexMap::from([("us-east-1".to_string(), "ami-base".to_string())]),
            buildable: true,
            instance_type: Some("m1.large".to_string()),
            phases: vec![Phase::named("base"), Phase::named("app")],
        }
    }

    #[test]
    fn test_st006_build_stack_shape() {
        let l = launchable();
        let def = BuiltinTemplates
            .make_build_stack("app", &l, "ami-base", &l.phases)
            .unwrap();

        let body = def.body();
        assert!(body["Resources"][BUILD_INSTANCE_LOGICAL_ID].is_object());
        assert_eq!(
            body["Resources"][BUILD_INSTANCE_LOGICAL_ID]["Properties"]["ImageId"],
            "ami-base"
        );
        assert_eq!(
            body["Resources"]["ProvisionComplete"]["Type"],
            "Cloud::Signal::WaitCondition"
        );
        assert!(body["Outputs"]["ProvisionData"].is_object());
    }

    #[test]
    fn test_st006_build_stack_phase_list() {
        let l = launchable();
        let def = BuiltinTemplates
            .make_build_stack("app", &l, "ami-base", &l.phases[1..])
            .unwrap();
        let phases = &def.body()["Resources"][BUILD_INSTANCE_LOGICAL_ID]["Properties"]["Phases"];
        assert_eq!(phases.as_array().unwrap().len(), 1);
        assert_eq!(phases[0]["Name"], "app");
    }

    #[test]
    fn test_st006_set_image_and_instance_type() {
        let l = launchable();
        let mut def = BuiltinTemplates
            .make_build_stack("app", &l, "ami-base", &l.phases)
            .unwrap();
        def.set_image(BUILD_INSTANCE_LOGICAL_ID, "ami-built").unwrap();
        def.set_instance_type(BUILD_INSTANCE_LOGICAL_ID, "m1.small")
            .unwrap();
        let props = &def.body()["Resources"][BUILD_INSTANCE_LOGICAL_ID]["Properties"];
        assert_eq!(props["ImageId"], "ami-built");
        assert_eq!(props["InstanceType"], "m1.small");
    }

    #[test]
    fn test_st006_set_image_unknown_resource() {
        let l = launchable();
        let mut def = BuiltinTemplates
            .make_build_stack("app", &l, "ami-base", &l.phases)
            .unwrap();
        assert!(def.set_image("Ghost", "ami-x").is_err());
    }

    #[test]
    fn test_st006_app_stack_one_instance_per_launchable() {
        let l = launchable();
        let def = BuiltinTemplates
            .make_app_stack(
                "web",
                &[
                    ("app".to_string(), l.clone(), "ami-run".to_string(), vec![]),
                    (
                        "worker".to_string(),
                        l.clone(),
                        "ami-base".to_string(),
                        vec![Phase::named("app")],
                    ),
                ],
            )
            .unwrap();
        let resources = def.body()["Resources"].as_object().unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources["app"]["Properties"]["ImageId"], "ami-run");
        assert_eq!(
            resources["worker"]["Properties"]["Phases"]
                .as_array()
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_st006_render_json() {
        let l = launchable();
        let def = BuiltinTemplates
            .make_build_stack("app", &l, "ami-base", &l.phases)
            .unwrap();
        let rendered = def.render_json().unwrap();
        assert!(rendered.contains("BuildInstance"));
        // Round-trips as valid JSON
        let _: Value = serde_json::from_str(&rendered).unwrap();
    }
}
