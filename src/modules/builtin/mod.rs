//! Built-in module implementations.
//!
//! | Identifier | Stage |
//! |---|---|
//! | `filter` | Prerequisite |
//! | `path`, `query-string`, `parse-json`, `stringify-json`, `version`, `key-md5` | Processor |
//! | `method-validator`, `path-validator`, `throttler` | Validator |
//! | `memory-cacher`, `file-cacher` | Cacher |
//! | `api-proxy` | Proxy |
//! | `json-reducer` | Enricher |
//! | `json-error` | ErrorResponseWrapper |

pub mod cachers;
pub mod enrichers;
pub mod error_wrappers;
pub mod prerequisites;
pub mod processors;
pub mod proxy;
pub mod validators;

use std::sync::Arc;

use crate::modules::registry::{parse_options, ModuleRegistry};
use crate::modules::{Capability, Module};

/// Register every built-in identifier.
pub fn register_all(registry: &mut ModuleRegistry) {
    registry.register("filter", Capability::Prerequisite, |config, ctx| {
        let module = prerequisites::FilterPrerequisite::new(config, ctx)?;
        Ok(Module::Prerequisite(Arc::new(module)))
    });

    registry.register("path", Capability::Processor, |config, ctx| {
        let module = processors::PathProcessor::new(parse_options(config)?, ctx.module_filters(config)?)?;
        Ok(Module::Processor(Arc::new(module)))
    });
    registry.register("query-string", Capability::Processor, |config, ctx| {
        let module = processors::QueryStringProcessor::new(parse_options(config)?, ctx.module_filters(config)?)?;
        Ok(Module::Processor(Arc::new(module)))
    });
    registry.register("parse-json", Capability::Processor, |config, ctx| {
        let module = processors::JsonParser::new(ctx.module_filters(config)?);
        Ok(Module::Processor(Arc::new(module)))
    });
    registry.register("stringify-json", Capability::Processor, |config, ctx| {
        let module = processors::JsonStringifier::new(ctx.module_filters(config)?);
        Ok(Module::Processor(Arc::new(module)))
    });
    registry.register("version", Capability::Processor, |config, ctx| {
        let module = processors::VersionProcessor::new(parse_options(config)?, ctx.module_filters(config)?)?;
        Ok(Module::Processor(Arc::new(module)))
    });
    registry.register("key-md5", Capability::Processor, |config, ctx| {
        let module = processors::KeyGenerator::new(parse_options(config)?, ctx.module_filters(config)?);
        Ok(Module::Processor(Arc::new(module)))
    });

    registry.register("method-validator", Capability::Validator, |config, ctx| {
        let module = validators::MethodValidator::new(ctx.module_filters(config)?);
        Ok(Module::Validator(Arc::new(module)))
    });
    registry.register("path-validator", Capability::Validator, |config, ctx| {
        let module = validators::PathValidator::new(parse_options(config)?, ctx.module_filters(config)?)?;
        Ok(Module::Validator(Arc::new(module)))
    });
    registry.register("throttler", Capability::Validator, |config, ctx| {
        let module = validators::Throttler::new(parse_options(config)?, ctx.module_filters(config)?, ctx.cache.clone());
        Ok(Module::Validator(Arc::new(module)))
    });

    registry.register("memory-cacher", Capability::Cacher, |config, ctx| {
        let module = cachers::MemoryCacher::new(parse_options(config)?, ctx.module_filters(config)?, ctx.cache.clone());
        Ok(Module::Cacher(Arc::new(module)))
    });
    registry.register("file-cacher", Capability::Cacher, |config, ctx| {
        let module = cachers::FileCacher::new(parse_options(config)?, ctx.module_filters(config)?)?;
        Ok(Module::Cacher(Arc::new(module)))
    });

    registry.register("api-proxy", Capability::Proxy, |config, ctx| {
        let module = proxy::ApiProxy::new(parse_options(config)?, ctx.module_filters(config)?, ctx.client.clone())?;
        Ok(Module::Proxy(Arc::new(module)))
    });

    registry.register("json-reducer", Capability::Enricher, |config, ctx| {
        let module = enrichers::JsonReducer::new(parse_options(config)?, ctx.module_filters(config)?)?;
        Ok(Module::Enricher(Arc::new(module)))
    });

    registry.register("json-error", Capability::ErrorResponseWrapper, |config, ctx| {
        let module = error_wrappers::JsonErrorWrapper::new(parse_options(config)?, ctx.module_filters(config)?);
        Ok(Module::ErrorResponseWrapper(Arc::new(module)))
    });
}
