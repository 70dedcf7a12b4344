//! Plugin registry: stable identifier → module factory.
//!
//! Configuration names an identifier through `require`; the registry resolves it to a
//! factory and checks the produced module satisfies the stage it is placed in.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use axum::body::Body;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;

use crate::cache::TtlCache;
use crate::config::ModuleConfig;
use crate::error::GatewayError;
use crate::filter::{Filter, FilterRegistry};
use crate::modules::{builtin, Capability, Module, ModuleFilters};

/// Upstream HTTP client shared by proxy modules.
pub type UpstreamClient = Client<HttpConnector, Body>;

/// Builds a module from its configuration.
pub type Factory = Arc<dyn Fn(&ModuleConfig, &ModuleContext) -> Result<Module, GatewayError> + Send + Sync>;

/// Services injected into every module factory.
#[derive(Clone)]
pub struct ModuleContext {
    pub filters: Arc<FilterRegistry>,
    pub cache: TtlCache,
    pub client: UpstreamClient,
    pub body_limit: usize,
}

impl ModuleContext {
    pub fn new(filters: Arc<FilterRegistry>, body_limit: usize) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            filters,
            cache: TtlCache::new(),
            client,
            body_limit,
        }
    }

    /// Resolve the filters a module gates itself with.
    pub fn module_filters(&self, config: &ModuleConfig) -> Result<ModuleFilters, GatewayError> {
        Ok(ModuleFilters::new(self.resolve_filters(&config.filters)?))
    }

    pub fn resolve_filters(&self, names: &[String]) -> Result<Vec<Arc<Filter>>, GatewayError> {
        self.filters
            .resolve(names)
            .map_err(|e| GatewayError::module(e.to_string()))
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("filters", &self.filters.len())
            .field("cache_entries", &self.cache.len())
            .field("body_limit", &self.body_limit)
            .finish()
    }
}

/// Deserialize a module's free-form options into its typed option struct.
pub fn parse_options<T: DeserializeOwned>(config: &ModuleConfig) -> Result<T, GatewayError> {
    serde_json::from_value(serde_json::Value::Object(config.options.clone())).map_err(|e| {
        GatewayError::module(format!("module [{}] has invalid options: {}", config.require, e))
    })
}

struct Registration {
    capability: Capability,
    factory: Factory,
}

/// Identifier → factory map, built once at startup.
pub struct ModuleRegistry {
    entries: BTreeMap<String, Registration>,
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// A registry holding every built-in module.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register (or replace) a module implementation under `identifier`.
    pub fn register<F>(&mut self, identifier: &str, capability: Capability, factory: F)
    where
        F: Fn(&ModuleConfig, &ModuleContext) -> Result<Module, GatewayError> + Send + Sync + 'static,
    {
        self.entries.insert(
            identifier.to_string(),
            Registration {
                capability,
                factory: Arc::new(factory),
            },
        );
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains_key(identifier)
    }

    /// Stage contract satisfied by modules registered under `identifier`.
    pub fn capability(&self, identifier: &str) -> Option<Capability> {
        self.entries.get(identifier).map(|r| r.capability)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Instantiate a module from its configuration.
    pub fn build(&self, config: &ModuleConfig, ctx: &ModuleContext) -> Result<Module, GatewayError> {
        let registration = self
            .entries
            .get(&config.require)
            .ok_or_else(|| GatewayError::module(format!("unknown module [{}]", config.require)))?;

        let module = (registration.factory)(config, ctx)?;
        if module.capability() != registration.capability {
            return Err(GatewayError::module(format!(
                "module [{}] registered as {} but built {}",
                config.require,
                registration.capability,
                module.capability()
            )));
        }
        Ok(module)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}
