//! ST-004: Per-stack variable environment and the typed stack registry.
//!
//! The registry maps a stack name to a constructor populated at startup;
//! stacks declared in stratus.yaml register a declarative factory that
//! substitutes `{{var}}` references in phase scripts from the environment.

use crate::core::error::{Error, Result};
use crate::core::types::Launchable;
use indexmap::IndexMap;
use std::collections::HashMap;

/// Key holding the per-stack fallback value in a variable overlay.
const DEFAULT_KEY: &str = "_default";

/// Global variables plus per-stack overlays.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    base: HashMap<String, String>,
    stack_vars: HashMap<String, HashMap<String, String>>,
}

impl Environment {
    pub fn new(base: HashMap<String, String>) -> Self {
        Self {
            base,
            stack_vars: HashMap::new(),
        }
    }

    /// Register a per-stack overlay for one variable. The inner map is
    /// stack name → value; `_default` applies when the stack has no entry.
    pub fn set_stack_var(&mut self, name: &str, values: HashMap<String, String>) {
        self.stack_vars.insert(name.to_string(), values);
    }

    /// Materialize the variable set visible to one stack.
    pub fn for_stack(&self, stack_name: &str) -> HashMap<String, String> {
        let mut env = self.base.clone();
        for (var, values) in &self.stack_vars {
            if let Some(v) = values.get(stack_name) {
                env.insert(var.clone(), v.clone());
            } else if let Some(v) = values.get(DEFAULT_KEY) {
                env.entry(var.clone()).or_insert_with(|| v.clone());
            }
        }
        env
    }
}

/// Substitute `{{var}}` references from an environment.
pub fn substitute_vars(template: &str, env: &HashMap<String, String>) -> Result<String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| Error::Config(format!("unclosed variable at position {}", open)))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = env
            .get(key)
            .ok_or_else(|| Error::Config(format!("unknown variable: {}", key)))?;

        result.replace_range(open..close, value);
        start = open + value.len();
    }

    Ok(result)
}

/// Constructs the launchable set for a stack given its variable environment.
pub trait StackFactory {
    fn construct(&self, env: &HashMap<String, String>) -> Result<IndexMap<String, Launchable>>;
}

/// Declarative factory: launchables from the project file with variable
/// substitution applied to phase scripts.
pub struct DeclaredStack {
    launchables: IndexMap<String, Launchable>,
}

impl DeclaredStack {
    pub fn new(launchables: IndexMap<String, Launchable>) -> Self {
        Self { launchables }
    }
}

impl StackFactory for DeclaredStack {
    fn construct(&self, env: &HashMap<String, String>) -> Result<IndexMap<String, Launchable>> {
        let mut out = IndexMap::new();
        for (name, launchable) in &self.launchables {
            let mut resolved = launchable.clone();
            for phase in &mut resolved.phases {
                if let Some(ref run) = phase.run {
                    phase.run = Some(substitute_vars(run, env)?);
                }
            }
            out.insert(name.clone(), resolved);
        }
        Ok(out)
    }
}

/// Typed registry mapping a stack name to its constructor.
#[derive(Default)]
pub struct StackRegistry {
    entries: IndexMap<String, Box<dyn StackFactory>>,
}

impl StackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: Box<dyn StackFactory>) {
        self.entries.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered stack names in declaration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Construct a stack's launchables under the given environment.
    pub fn construct(
        &self,
        name: &str,
        environment: &Environment,
    ) -> Result<IndexMap<String, Launchable>> {
        let factory = self
            .entries
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown stack: {}", name)))?;
        factory.construct(&environment.for_stack(name))
    }
}
