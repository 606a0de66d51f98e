//! ST-010: Reconciler — idempotent stack lifecycle over the provider API.
//!
//! No business logic: create-or-update with conflict detection, tag-predicate
//! discovery of non-deleted stacks, status projections, resource description,
//! idempotent delete, and a structural template diff for change preview.

use crate::cloud::{StackApi, StackResource};
use crate::core::error::{Error, Result};
use crate::core::template::StackDefinition;
use crate::core::types::{StackStatus, Tags};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Handle to a remote stack, usable for subsequent status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackHandle {
    pub id: String,
    pub name: String,
}

/// Stack lifecycle abstraction over a raw provider binding.
pub struct Reconciler<A: StackApi> {
    api: A,
    template_store: String,
}

impl<A: StackApi> Reconciler<A> {
    pub fn new(api: A, template_store: &str) -> Self {
        Self {
            api,
            template_store: template_store.to_string(),
        }
    }

    /// Create the stack, or update it when it already exists and updates are
    /// allowed. The rendered definition is uploaded to blob storage and
    /// referenced by URL: definitions may exceed inline size limits.
    pub fn create_or_update(
        &self,
        definition: &StackDefinition,
        name: &str,
        tags: &Tags,
        allow_update: bool,
    ) -> Result<StackHandle> {
        let exists = self.exists(name)?;
        if exists && !allow_update {
            return Err(Error::Conflict(name.to_string()));
        }

        let body = definition.render_json()?;
        let url = self.upload_template(name, &body)?;

        let id = if exists {
            tracing::info!(stack = name, "updating stack");
            self.api.update_stack(name, &url)?
        } else {
            tracing::info!(stack = name, "creating stack");
            self.api.create_stack(name, &url, tags)?
        };
        Ok(StackHandle {
            id,
            name: name.to_string(),
        })
    }

    /// All non-deleted stacks whose tags are a superset of the predicate.
    pub fn find(&self, tags: &Tags) -> Result<Vec<StackHandle>> {
        let stacks = self.api.list_stacks()?;
        Ok(stacks
            .into_iter()
            .filter(|s| s.status != StackStatus::Deleted)
            .filter(|s| tags.iter().all(|(k, v)| s.tags.get(k) == Some(v)))
            .map(|s| StackHandle {
                id: s.id,
                name: s.name,
            })
            .collect())
    }

    /// Current status; a stack the provider no longer knows is `Deleted`.
    pub fn status(&self, handle: &StackHandle) -> Result<StackStatus> {
        match self.api.describe_stack(&handle.id)? {
            Some(desc) => Ok(desc.status),
            None => Ok(StackStatus::Deleted),
        }
    }

    pub fn is_being_created(&self, handle: &StackHandle) -> Result<bool> {
        Ok(self.status(handle)?.is_being_created())
    }

    pub fn is_created(&self, handle: &StackHandle) -> Result<bool> {
        Ok(self.status(handle)?.is_created())
    }

    pub fn is_failed_or_rolled_back(&self, handle: &StackHandle) -> Result<bool> {
        Ok(self.status(handle)?.is_failed_or_rolled_back())
    }

    pub fn is_being_deleted(&self, handle: &StackHandle) -> Result<bool> {
        Ok(self.status(handle)?.is_being_deleted())
    }

    /// Stack resources keyed by logical name; used to recover a launched
    /// instance's physical id.
    pub fn describe_resources(
        &self,
        handle: &StackHandle,
    ) -> Result<FxHashMap<String, StackResource>> {
        let resources = self.api.describe_stack_resources(&handle.id)?;
        Ok(resources
            .into_iter()
            .map(|r| (r.logical_id.clone(), r))
            .collect())
    }

    /// Idempotent delete: deleting an unknown or already-deleted stack is
    /// not an error.
    pub fn delete(&self, handle: &StackHandle) -> Result<()> {
        match self.api.describe_stack(&handle.id)? {
            None => Ok(()),
            Some(desc) if desc.status == StackStatus::Deleted => Ok(()),
            Some(_) => {
                tracing::info!(stack = %handle.name, "deleting stack");
                self.api.delete_stack(&handle.id)
            }
        }
    }

    /// Structural difference between a local definition and the deployed
    /// template. Change-preview tooling only, not on the build/deploy path.
    pub fn diff(&self, definition: &StackDefinition, name: &str) -> Result<Vec<DiffEntry>> {
        if !self.exists(name)? {
            return Err(Error::Remote(format!("stack {} is not deployed", name)));
        }
        let remote = self.api.get_template(name)?;
        let mut entries = Vec::new();
        diff_values("", &remote, definition.body(), &mut entries);
        Ok(entries)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        match self.api.describe_stack(name)? {
            Some(desc) => Ok(desc.status != StackStatus::Deleted),
            None => Ok(false),
        }
    }

    fn upload_template(&self, name: &str, body: &str) -> Result<String> {
        let key = template_key(name);
        tracing::info!(
            stack = name,
            size_kb = body.len() / 1024,
            store = %self.template_store,
            "uploading stack template"
        );
        self.api
            .upload_template(&format!("{}/{}", self.template_store, key), body)
    }
}

/// Unique storage key for an uploaded template.
fn template_key(stack_name: &str) -> String {
    static SANITIZE: OnceLock<regex::Regex> = OnceLock::new();
    let re = SANITIZE.get_or_init(|| regex::Regex::new(r"[^\w\-]").expect("static pattern"));
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "stratus-{}-{}-{:04x}",
        re.replace_all(stack_name, "-"),
        now.as_secs(),
        now.subsec_nanos() & 0xffff
    )
}

/// One structural difference between deployed and local templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEntry {
    Added { path: String },
    Removed { path: String },
    Changed { path: String, remote: String, local: String },
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added { path } => write!(f, "+ {}", path),
            Self::Removed { path } => write!(f, "- {}", path),
            Self::Changed {
                path,
                remote,
                local,
            } => write!(f, "~ {}: {} -> {}", path, remote, local),
        }
    }
}

fn diff_values(
    path: &str,
    remote: &serde_json::Value,
    local: &serde_json::Value,
    out: &mut Vec<DiffEntry>,
) {
    use serde_json::Value;
    match (remote, local) {
        (Value::Object(r), Value::Object(l)) => {
            for (key, rv) in r {
                let child = join_path(path, key);
                match l.get(key) {
                    Some(lv) => diff_values(&child, rv, lv, out),
                    None => out.push(DiffEntry::Removed { path: child }),
                }
            }
            for key in l.keys() {
                if !r.contains_key(key) {
                    out.push(DiffEntry::Added {
                        path: join_path(path, key),
                    });
                }
            }
        }
        (r, l) if r != l => out.push(DiffEntry::Changed {
            path: path.to_string(),
            remote: r.to_string(),
            local: l.to_string(),
        }),
        _ => {}
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}
