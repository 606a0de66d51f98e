//! ST-012: In-memory provider.
//!
//! The built-in `sim` binding and the backend the orchestration tests drive.
//! Remote transitions are poll-driven: an in-progress status is observed a
//! configurable number of times before flipping to its terminal state, so
//! the driver loop exercises its "stay" branches against the real code path.

use crate::cloud::{ComputeApi, StackApi, StackDescription, StackResource};
use crate::core::error::{Error, Result};
use crate::core::types::{ImageState, InstanceState, StackStatus, Tags};
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::Mutex;

const INSTANCE_RESOURCE_TYPE: &str = "Cloud::Compute::Instance";

#[derive(Debug, Clone)]
struct SimStack {
    id: String,
    name: String,
    status: StackStatus,
    tags: Tags,
    template_key: String,
    resources: Vec<StackResource>,
    remaining: u32,
    scripted_failure: bool,
}

#[derive(Debug, Clone)]
struct SimInstance {
    state: InstanceState,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct SimImage {
    state: ImageState,
    tags: Tags,
    remaining: u32,
    scripted_failure: bool,
}

#[derive(Default)]
struct Inner {
    stacks: FxHashMap<String, SimStack>,
    instances: FxHashMap<String, SimInstance>,
    images: FxHashMap<String, SimImage>,
    blobs: FxHashMap<String, String>,
    fail_stacks: HashSet<String>,
    fail_next_image: bool,
    create_calls: FxHashMap<String, u32>,
    delete_calls: FxHashMap<String, u32>,
    stop_calls: FxHashMap<String, u32>,
    list_calls: u32,
    seq: u32,
    poll_delay: u32,
}

/// In-memory cloud with scripted failures and call counters.
pub struct SimCloud {
    inner: Mutex<Inner>,
}

impl Default for SimCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCloud {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                poll_delay: 1,
                ..Inner::default()
            }),
        }
    }

    /// Observe each in-progress status `polls` times before it settles.
    pub fn with_poll_delay(self, polls: u32) -> Self {
        self.lock().poll_delay = polls;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- scripting ----------------------------------------------------------

    /// Make creation of the named stack roll back instead of completing.
    pub fn fail_stack_creation(&self, name: &str) {
        self.lock().fail_stacks.insert(name.to_string());
    }

    /// Undo `fail_stack_creation`; later creations of the stack complete.
    pub fn clear_stack_failure(&self, name: &str) {
        self.lock().fail_stacks.remove(name);
    }

    /// Make the next snapshot end in a failed image.
    pub fn fail_next_image(&self) {
        self.lock().fail_next_image = true;
    }

    /// Pre-existing available image with the given tags.
    pub fn seed_image(&self, tags: &Tags) -> String {
        let mut inner = self.lock();
        let id = inner.next_id("ami");
        inner.images.insert(
            id.clone(),
            SimImage {
                state: ImageState::Available,
                tags: tags.clone(),
                remaining: 0,
                scripted_failure: false,
            },
        );
        id
    }

    /// Pre-existing instance in the given power state.
    pub fn seed_instance(&self, state: InstanceState) -> String {
        let mut inner = self.lock();
        let id = inner.next_id("i");
        inner.instances.insert(
            id.clone(),
            SimInstance {
                state,
                remaining: 0,
            },
        );
        id
    }

    /// Force an instance into a power state (for anomaly scenarios).
    pub fn set_instance_state(&self, instance_id: &str, state: InstanceState) {
        let mut inner = self.lock();
        if let Some(instance) = inner.instances.get_mut(instance_id) {
            instance.state = state;
            instance.remaining = 0;
        }
    }

    /// Pre-existing stack in a settled status, with a running build instance.
    pub fn seed_stack(&self, name: &str, tags: &Tags, status: StackStatus) -> String {
        let mut inner = self.lock();
        let stack_id = inner.next_id("stk");
        let instance_id = inner.next_id("i");
        inner.instances.insert(
            instance_id.clone(),
            SimInstance {
                state: InstanceState::Running,
                remaining: 0,
            },
        );
        inner.stacks.insert(
            name.to_string(),
            SimStack {
                id: stack_id.clone(),
                name: name.to_string(),
                status,
                tags: tags.clone(),
                template_key: String::new(),
                resources: vec![StackResource {
                    logical_id: "BuildInstance".to_string(),
                    resource_type: INSTANCE_RESOURCE_TYPE.to_string(),
                    physical_id: instance_id,
                    status: "CREATE_COMPLETE".to_string(),
                }],
                remaining: 0,
                scripted_failure: false,
            },
        );
        stack_id
    }

    // -- inspection ---------------------------------------------------------

    pub fn create_calls(&self, name: &str) -> u32 {
        self.lock().create_calls.get(name).copied().unwrap_or(0)
    }

    pub fn delete_calls(&self, name: &str) -> u32 {
        self.lock().delete_calls.get(name).copied().unwrap_or(0)
    }

    pub fn stop_calls(&self, instance_id: &str) -> u32 {
        self.lock().stop_calls.get(instance_id).copied().unwrap_or(0)
    }

    pub fn list_calls(&self) -> u32 {
        self.lock().list_calls
    }

    /// Number of stacks currently in a creating or created state.
    pub fn live_stacks(&self) -> usize {
        self.lock()
            .stacks
            .values()
            .filter(|s| matches!(s.status, StackStatus::Creating | StackStatus::Created))
            .count()
    }

    /// Drive every pending transition to its settled state.
    pub fn settle(&self) {
        let mut inner = self.lock();
        for stack in inner.stacks.values_mut() {
            stack.remaining = 0;
            loop {
                let next = settled_step(stack.status, stack.scripted_failure);
                if next == stack.status {
                    break;
                }
                stack.status = next;
            }
        }
        for instance in inner.instances.values_mut() {
            instance.remaining = 0;
            instance.state = settled_instance_state(instance.state);
        }
        for image in inner.images.values_mut() {
            image.remaining = 0;
            image.state = settled_image_state(image.state, image.scripted_failure);
        }
    }
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{}-{:04x}", prefix, self.seq)
    }

    fn stack_mut_by_ref(&mut self, name_or_id: &str) -> Option<&mut SimStack> {
        if self.stacks.contains_key(name_or_id) {
            return self.stacks.get_mut(name_or_id);
        }
        self.stacks.values_mut().find(|s| s.id == name_or_id)
    }

    /// One poll against a stack: observe, then advance the countdown.
    fn poll_stack(&mut self, name_or_id: &str) -> Option<StackDescription> {
        let poll_delay = self.poll_delay;
        let stack = self.stack_mut_by_ref(name_or_id)?;
        if stack.remaining > 0 {
            stack.remaining -= 1;
        } else {
            let next = settled_step(stack.status, stack.scripted_failure);
            if next != stack.status {
                stack.status = next;
                stack.remaining = if is_in_progress(next) { poll_delay } else { 0 };
            }
        }
        Some(StackDescription {
            id: stack.id.clone(),
            name: stack.name.clone(),
            status: stack.status,
            tags: stack.tags.clone(),
        })
    }

    fn materialize_resources(&mut self, template_key: &str) -> Vec<StackResource> {
        let body: serde_json::Value = self
            .blobs
            .get(template_key)
            .and_then(|b| serde_json::from_str(b).ok())
            .unwrap_or_default();
        let mut resources = Vec::new();
        if let Some(map) = body.get("Resources").and_then(|r| r.as_object()) {
            let declared: Vec<(String, String)> = map
                .iter()
                .map(|(k, v)| {
                    let kind = v
                        .get("Type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("")
                        .to_string();
                    (k.clone(), kind)
                })
                .collect();
            for (logical_id, resource_type) in declared {
                let physical_id = if resource_type == INSTANCE_RESOURCE_TYPE {
                    let id = self.next_id("i");
                    self.instances.insert(
                        id.clone(),
                        SimInstance {
                            state: InstanceState::Running,
                            remaining: 0,
                        },
                    );
                    id
                } else {
                    format!("sim-{}", logical_id)
                };
                resources.push(StackResource {
                    logical_id,
                    resource_type,
                    physical_id,
                    status: "CREATE_COMPLETE".to_string(),
                });
            }
        }
        resources
    }
}

/// Next status after one settled countdown.
fn settled_step(status: StackStatus, scripted_failure: bool) -> StackStatus {
    match status {
        StackStatus::Creating if scripted_failure => StackStatus::RollingBack,
        StackStatus::Creating => StackStatus::Created,
        StackStatus::RollingBack => StackStatus::Failed,
        StackStatus::Deleting => StackStatus::Deleted,
        other => other,
    }
}

fn is_in_progress(status: StackStatus) -> bool {
    matches!(
        status,
        StackStatus::Creating | StackStatus::RollingBack | StackStatus::Deleting
    )
}

fn settled_instance_state(state: InstanceState) -> InstanceState {
    match state {
        InstanceState::Pending => InstanceState::Running,
        InstanceState::Stopping => InstanceState::Stopped,
        InstanceState::ShuttingDown => InstanceState::Terminated,
        other => other,
    }
}

fn settled_image_state(state: ImageState, scripted_failure: bool) -> ImageState {
    match state {
        ImageState::Pending if scripted_failure => ImageState::Failed,
        ImageState::Pending => ImageState::Available,
        other => other,
    }
}

impl StackApi for SimCloud {
    fn create_stack(&self, name: &str, template_url: &str, tags: &Tags) -> Result<String> {
        let mut inner = self.lock();
        if let Some(existing) = inner.stacks.get(name) {
            if existing.status != StackStatus::Deleted {
                return Err(Error::Remote(format!("stack {} already exists", name)));
            }
        }
        let key = template_url
            .strip_prefix("sim://")
            .unwrap_or(template_url)
            .to_string();
        let id = inner.next_id("stk");
        let resources = inner.materialize_resources(&key);
        let scripted_failure = inner.fail_stacks.contains(name);
        let poll_delay = inner.poll_delay;
        *inner.create_calls.entry(name.to_string()).or_insert(0) += 1;
        inner.stacks.insert(
            name.to_string(),
            SimStack {
                id: id.clone(),
                name: name.to_string(),
                status: StackStatus::Creating,
                tags: tags.clone(),
                template_key: key,
                resources,
                remaining: poll_delay,
                scripted_failure,
            },
        );
        Ok(id)
    }

    fn update_stack(&self, name: &str, template_url: &str) -> Result<String> {
        let mut inner = self.lock();
        let key = template_url
            .strip_prefix("sim://")
            .unwrap_or(template_url)
            .to_string();
        let poll_delay = inner.poll_delay;
        let stack = inner
            .stack_mut_by_ref(name)
            .ok_or_else(|| Error::Remote(format!("no such stack: {}", name)))?;
        stack.template_key = key;
        stack.status = StackStatus::Creating;
        stack.remaining = poll_delay;
        Ok(stack.id.clone())
    }

    fn delete_stack(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let poll_delay = inner.poll_delay;
        let name_owned = {
            let stack = inner
                .stack_mut_by_ref(name)
                .ok_or_else(|| Error::Remote(format!("no such stack: {}", name)))?;
            if stack.status != StackStatus::Deleted {
                stack.status = StackStatus::Deleting;
                stack.remaining = poll_delay;
            }
            stack.name.clone()
        };
        *inner.delete_calls.entry(name_owned).or_insert(0) += 1;
        Ok(())
    }

    fn describe_stack(&self, name_or_id: &str) -> Result<Option<StackDescription>> {
        Ok(self.lock().poll_stack(name_or_id))
    }

    fn list_stacks(&self) -> Result<Vec<StackDescription>> {
        let mut inner = self.lock();
        inner.list_calls += 1;
        Ok(inner
            .stacks
            .values()
            .map(|s| StackDescription {
                id: s.id.clone(),
                name: s.name.clone(),
                status: s.status,
                tags: s.tags.clone(),
            })
            .collect())
    }

    fn describe_stack_resources(&self, name_or_id: &str) -> Result<Vec<StackResource>> {
        let mut inner = self.lock();
        let stack = inner
            .stack_mut_by_ref(name_or_id)
            .ok_or_else(|| Error::Remote(format!("no such stack: {}", name_or_id)))?;
        Ok(stack.resources.clone())
    }

    fn get_template(&self, name_or_id: &str) -> Result<serde_json::Value> {
        let mut inner = self.lock();
        let key = inner
            .stack_mut_by_ref(name_or_id)
            .map(|s| s.template_key.clone())
            .ok_or_else(|| Error::Remote(format!("no such stack: {}", name_or_id)))?;
        let body = inner
            .blobs
            .get(&key)
            .ok_or_else(|| Error::Remote(format!("no template stored for {}", name_or_id)))?;
        serde_json::from_str(body).map_err(|e| Error::Remote(format!("stored template: {}", e)))
    }

    fn upload_template(&self, key: &str, body: &str) -> Result<String> {
        let mut inner = self.lock();
        inner.blobs.insert(key.to_string(), body.to_string());
        Ok(format!("sim://{}", key))
    }
}

impl ComputeApi for SimCloud {
    fn instance_state(&self, instance_id: &str) -> Result<InstanceState> {
        let mut inner = self.lock();
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::Remote(format!("no such instance: {}", instance_id)))?;
        if instance.remaining > 0 {
            instance.remaining -= 1;
        } else {
            instance.state = settled_instance_state(instance.state);
        }
        Ok(instance.state)
    }

    fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let poll_delay = inner.poll_delay;
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::Remote(format!("no such instance: {}", instance_id)))?;
        if instance.state == InstanceState::Running {
            instance.state = InstanceState::Stopping;
            instance.remaining = poll_delay;
        }
        *inner.stop_calls.entry(instance_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn create_image(
        &self,
        instance_id: &str,
        _name: &str,
        _description: &str,
        tags: &Tags,
    ) -> Result<String> {
        let mut inner = self.lock();
        if !inner.instances.contains_key(instance_id) {
            return Err(Error::Remote(format!("no such instance: {}", instance_id)));
        }
        let id = inner.next_id("ami");
        let scripted_failure = std::mem::take(&mut inner.fail_next_image);
        let poll_delay = inner.poll_delay;
        inner.images.insert(
            id.clone(),
            SimImage {
                state: ImageState::Pending,
                tags: tags.clone(),
                remaining: poll_delay,
                scripted_failure,
            },
        );
        Ok(id)
    }

    fn image_state(&self, image_id: &str) -> Result<ImageState> {
        let mut inner = self.lock();
        let image = inner
            .images
            .get_mut(image_id)
            .ok_or_else(|| Error::Remote(format!("no such image: {}", image_id)))?;
        if image.remaining > 0 {
            image.remaining -= 1;
        } else {
            image.state = settled_image_state(image.state, image.scripted_failure);
        }
        Ok(image.state)
    }

    fn find_images(&self, tags: &Tags) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut matches: Vec<String> = inner
            .images
            .iter()
            .filter(|(_, img)| tags.iter().all(|(k, v)| img.tags.get(k) == Some(v)))
            .map(|(id, _)| id.clone())
            .collect();
        matches.sort();
        Ok(matches)
    }
}
