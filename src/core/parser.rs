//! ST-003: Project file parsing and validation.
//!
//! Parses stratus.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Target region must be set
//! - Buildable launchables need a base image for the target region
//! - Phase names must be unique and non-empty within a launchable

use crate::core::error::{Error, Result};
use crate::core::types::Launchable;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Root project configuration — the desired state of the cloud environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Project name; used as the owner tag on build stacks
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Target environment
    pub target: TargetConfig,

    /// Global variables, substitutable in phase scripts
    #[serde(default)]
    pub params: HashMap<String, String>,

    /// Per-stack variable overlays; inner map is stack name → value, with
    /// `_default` as the fallback entry
    #[serde(default)]
    pub vars: HashMap<String, HashMap<String, String>>,

    /// Stack declarations (order-preserving)
    #[serde(default)]
    pub stacks: IndexMap<String, StackDecl>,
}

/// Target environment: one region, one provider binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Region all stacks and images live in
    pub region: String,

    /// Blob container for rendered templates; derived from the project name
    /// when absent
    #[serde(default)]
    pub template_store: Option<String>,

    /// Provider binding ("sim" is built in)
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    "sim".to_string()
}

impl TargetConfig {
    /// Template store name, falling back to a project-derived default.
    pub fn template_store_or(&self, project: &str) -> String {
        match self.template_store {
            Some(ref s) => s.clone(),
            None => format!("stratus-templates-{}", project),
        }
    }
}

/// A declared stack: a named set of launchables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackDecl {
    /// Launchables by logical name
    #[serde(default)]
    pub launchables: IndexMap<String, Launchable>,
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a stratus.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<ProjectConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config(&content)
}

/// Parse a stratus.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<ProjectConfig> {
    serde_yaml_ng::from_str(yaml).map_err(|e| Error::Config(format!("YAML parse error: {}", e)))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &ProjectConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(ValidationError {
            message: format!("version must be \"1.0\", got \"{}\"", config.version),
        });
    }

    if config.name.is_empty() {
        errors.push(ValidationError {
            message: "name must not be empty".to_string(),
        });
    }

    if config.target.region.is_empty() {
        errors.push(ValidationError {
            message: "target.region must not be empty".to_string(),
        });
    }

    for (stack_name, stack) in &config.stacks {
        for (launchable_name, launchable) in &stack.launchables {
            let where_ = format!("stack '{}' launchable '{}'", stack_name, launchable_name);

            if launchable.base_image.is_empty() {
                errors.push(ValidationError {
                    message: format!("{} declares no base image", where_),
                });
            } else if !launchable.base_image.contains_key(&config.target.region) {
                errors.push(ValidationError {
                    message: format!(
                        "{} has no base image for target region '{}'",
                        where_, config.target.region
                    ),
                });
            }

            if launchable.buildable && launchable.phases.is_empty() {
                errors.push(ValidationError {
                    message: format!("{} is buildable but has no phases", where_),
                });
            }

            let mut seen = std::collections::HashSet::new();
            for phase in &launchable.phases {
                if phase.name.is_empty() {
                    errors.push(ValidationError {
                        message: format!("{} has a phase with an empty name", where_),
                    });
                }
                if !seen.insert(phase.name.as_str()) {
                    errors.push(ValidationError {
                        message: format!("{} has duplicate phase '{}'", where_, phase.name),
                    });
                }
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
version: "1.0"
name: acme
target:
  region: us-east-1
params:
  domain: acme.example
vars:
  db_size:
    _default: small
    web: large
stacks:
  web:
    launchables:
      app:
        base_image:
          us-east-1: ami-0abc
        instance_type: m1.small
        phases:
          - name: base
            run: ./scripts/base.sh
          - name: app
"#;

    #[test]
    fn test_st003_parse_valid() {
        let config = parse_config(VALID).unwrap();
        assert_eq!(config.name, "acme");
        assert_eq!(config.target.region, "us-east-1");
        assert_eq!(config.target.provider, "sim");
        assert_eq!(config.stacks["web"].launchables.len(), 1);
        let errors = validate_config(&config);
        assert!(
            errors.is_empty(),
            "unexpected errors: {:?}",
            errors.iter().map(|e| &e.message).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_st003_template_store_default() {
        let config = parse_config(VALID).unwrap();
        assert_eq!(
            config.target.template_store_or(&config.name),
            "stratus-templates-acme"
        );
    }

    #[test]
    fn test_st003_bad_version() {
        let yaml = r#"
version: "2.0"
name: t
target:
  region: us-east-1
"#;
        let config = parse_config(yaml).unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("version")));
    }

    #[test]
    fn test_st003_missing_region_base_image() {
        let yaml = r#"
version: "1.0"
name: t
target:
  region: eu-west-1
stacks:
  web:
    launchables:
      app:
        base_image:
          us-east-1: ami-0abc
        phases:
          - name: base
"#;
        let config = parse_config(yaml).unwrap();
        let errors = validate_config(&config);
        assert!(errors
            .iter()
            .any(|e| e.message.contains("no base image for target region")));
    }

    #[test]
    fn test_st003_buildable_without_phases() {
        let yaml = r#"
version: "1.0"
name: t
target:
  region: us-east-1
stacks:
  web:
    launchables:
      app:
        base_image:
          us-east-1: ami-0abc
"#;
        let config = parse_config(yaml).unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("no phases")));
    }

    #[test]
    fn test_st003_duplicate_phase() {
        let yaml = r#"
version: "1.0"
name: t
target:
  region: us-east-1
stacks:
  web:
    launchables:
      app:
        base_image:
          us-east-1: ami-0abc
        phases:
          - name: base
          - name: base
"#;
        let config = parse_config(yaml).unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("duplicate phase")));
    }

    #[test]
    fn test_st003_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratus.yaml");
        std::fs::write(&path, VALID).unwrap();
        let config = parse_config_file(&path).unwrap();
        assert_eq!(config.name, "acme");
    }

    #[test]
    fn test_st003_parse_invalid_yaml() {
        assert!(parse_config("not: [valid: yaml: {{").is_err());
    }

    #[test]
    fn test_st003_parse_missing_file() {
        let result = parse_config_file(Path::new("/nonexistent/stratus.yaml"));
        assert!(result.is_err());
    }
}
