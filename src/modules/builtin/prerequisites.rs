//! Prerequisite modules.

use std::sync::Arc;

use serde::Deserialize;

use crate::config::ModuleConfig;
use crate::error::{GatewayError, ModuleError};
use crate::filter::Filter;
use crate::http::context::RequestContext;
use crate::http::response::ResponseContext;
use crate::modules::registry::{parse_options, ModuleContext};
use crate::modules::{ModuleFilters, Prerequisite};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FilterPrerequisiteOptions {
    validation_filters: Vec<String>,
}

/// When the module's own filters match, every validation filter must be fulfilled too.
///
/// Lets a config say "requests to /admin must come from the office range" without
/// reading the body first.
pub struct FilterPrerequisite {
    filters: ModuleFilters,
    validation_filters: Vec<Arc<Filter>>,
}

impl FilterPrerequisite {
    pub fn new(config: &ModuleConfig, ctx: &ModuleContext) -> Result<Self, GatewayError> {
        let options: FilterPrerequisiteOptions = parse_options(config)?;
        Ok(Self {
            filters: ctx.module_filters(config)?,
            validation_filters: ctx.resolve_filters(&options.validation_filters)?,
        })
    }
}

impl Prerequisite for FilterPrerequisite {
    fn is_fulfilled(&self, request: &RequestContext, _response: &ResponseContext) -> Result<(), ModuleError> {
        if !self.filters.matches(request) {
            return Ok(());
        }
        for filter in &self.validation_filters {
            if !filter.get(request).is_fulfilled(false) {
                return Err(ModuleError::rejected(format!(
                    "Filter [{}] failed validation",
                    filter.name()
                )));
            }
        }
        Ok(())
    }
}
