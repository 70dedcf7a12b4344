//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (workflows reference existing filters, modules, bases)
//! - Compile every regex and IP range once so bad patterns fail at load, not per request
//! - Detect `extends` cycles
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system (at startup and before every reload)

use std::collections::{BTreeMap, HashSet};

use crate::config::schema::{GatewayConfig, ModuleConfig, ModuleRef, WorkflowConfig};
use crate::filter::matcher::parse_ip_range;
use crate::modules::registry::ModuleRegistry;
use crate::modules::Capability;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("at least one of ports.http or ports.https must be set")]
    NoPorts,

    #[error("ports.https requires sslOptions")]
    MissingSslOptions,

    #[error("admin.apiKey must be set when the admin API is enabled")]
    MissingAdminKey,

    #[error("bodyLimit must be greater than zero")]
    ZeroBodyLimit,

    #[error("filter [{filter}] has invalid regex [{pattern}]: {reason}")]
    InvalidRegex {
        filter: String,
        pattern: String,
        reason: String,
    },

    #[error("filter [{filter}] has invalid IP range [{range}]")]
    InvalidIpRange { filter: String, range: String },

    #[error("filter [{filter}] requires unknown implementation [{require}]")]
    UnknownFilterImplementation { filter: String, require: String },

    #[error("{owner} references undefined filter [{filter}]")]
    UnknownFilter { owner: String, filter: String },

    #[error("{owner} requires unknown module [{require}]")]
    UnknownModuleType { owner: String, require: String },

    #[error("Module {module} is not defined for workflow {workflow}")]
    UnknownModule { workflow: String, module: String },

    #[error("{owner} uses [{require}] as {stage} but it is a {capability} module")]
    StageMismatch {
        owner: String,
        require: String,
        stage: String,
        capability: String,
    },

    #[error("workflow [{workflow}] extends undefined workflow [{base}]")]
    UnknownBase { workflow: String, base: String },

    #[error("workflow [{workflow}] has an extends cycle")]
    ExtendsCycle { workflow: String },
}

/// Validate a configuration against the built-in module registry.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    validate_with_registry(config, &ModuleRegistry::with_builtins())
}

/// Validate a configuration against a specific module registry.
pub fn validate_with_registry(
    config: &GatewayConfig,
    registry: &ModuleRegistry,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.ports.http.is_none() && config.ports.https.is_none() {
        errors.push(ValidationError::NoPorts);
    }
    if config.ports.https.is_some() && config.ssl_options.is_none() {
        errors.push(ValidationError::MissingSslOptions);
    }
    if config.admin.enabled && config.admin.api_key.is_empty() {
        errors.push(ValidationError::MissingAdminKey);
    }
    if config.body_limit == 0 {
        errors.push(ValidationError::ZeroBodyLimit);
    }

    for (name, filter) in &config.filters {
        if let Some(require) = &filter.require {
            if require != "filter" {
                errors.push(ValidationError::UnknownFilterImplementation {
                    filter: name.clone(),
                    require: require.clone(),
                });
            }
        }
        let patterns = filter
            .content_types
            .iter()
            .chain(filter.paths.iter())
            .flatten();
        for pattern in patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(ValidationError::InvalidRegex {
                    filter: name.clone(),
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }
        if let Some(ranges) = &filter.ip_range {
            for range in ranges.to_vec() {
                if parse_ip_range(&range).is_none() {
                    errors.push(ValidationError::InvalidIpRange {
                        filter: name.clone(),
                        range,
                    });
                }
            }
        }
    }

    for (name, module) in &config.modules {
        check_module(config, registry, &format!("module [{}]", name), module, &mut errors);
    }

    for (name, workflow) in &config.workflows {
        check_workflow(config, registry, name, workflow, &mut errors);
    }
    check_extends_cycles(&config.workflows, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_filters(config: &GatewayConfig, owner: &str, filters: &[String], errors: &mut Vec<ValidationError>) {
    for filter in filters {
        if !config.filters.contains_key(filter) {
            errors.push(ValidationError::UnknownFilter {
                owner: owner.to_string(),
                filter: filter.clone(),
            });
        }
    }
}

fn check_module(
    config: &GatewayConfig,
    registry: &ModuleRegistry,
    owner: &str,
    module: &ModuleConfig,
    errors: &mut Vec<ValidationError>,
) {
    if !registry.contains(&module.require) {
        errors.push(ValidationError::UnknownModuleType {
            owner: owner.to_string(),
            require: module.require.clone(),
        });
    }
    check_filters(config, owner, &module.filters, errors);
}

fn check_workflow(
    config: &GatewayConfig,
    registry: &ModuleRegistry,
    name: &str,
    workflow: &WorkflowConfig,
    errors: &mut Vec<ValidationError>,
) {
    let owner = format!("workflow [{}]", name);
    check_filters(config, &owner, &workflow.filters, errors);

    if let Some(base) = &workflow.extends {
        if !config.workflows.contains_key(base) {
            errors.push(ValidationError::UnknownBase {
                workflow: name.to_string(),
                base: base.clone(),
            });
        }
    }

    for (stage, refs) in workflow.stage_refs() {
        for module_ref in refs {
            match module_ref {
                ModuleRef::Named(module) => match config.modules.get(module) {
                    Some(shared) => check_stage(registry, &owner, shared, stage, errors),
                    None => errors.push(ValidationError::UnknownModule {
                        workflow: name.to_string(),
                        module: module.clone(),
                    }),
                },
                ModuleRef::Inline(module) => {
                    let owner = format!("workflow [{}] {}", name, stage);
                    check_module(config, registry, &owner, module, errors);
                    check_stage(registry, &owner, module, stage, errors);
                }
            }
        }
    }
}

/// A module placed in a stage list must satisfy that stage's contract.
fn check_stage(
    registry: &ModuleRegistry,
    owner: &str,
    module: &ModuleConfig,
    stage: Capability,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(capability) = registry.capability(&module.require) {
        if capability != stage {
            errors.push(ValidationError::StageMismatch {
                owner: owner.to_string(),
                require: module.require.clone(),
                stage: stage.to_string(),
                capability: capability.to_string(),
            });
        }
    }
}

fn check_extends_cycles(workflows: &BTreeMap<String, WorkflowConfig>, errors: &mut Vec<ValidationError>) {
    for name in workflows.keys() {
        let mut seen = HashSet::new();
        let mut current = Some(name.as_str());
        while let Some(workflow) = current {
            if !seen.insert(workflow) {
                errors.push(ValidationError::ExtendsCycle {
                    workflow: name.clone(),
                });
                break;
            }
            current = workflows.get(workflow).and_then(|w| w.extends.as_deref());
        }
    }
}
