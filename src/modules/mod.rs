//! Pluggable pipeline modules.
//!
//! # Data Flow
//! ```text
//! ModuleConfig { require: "<identifier>", filters, ...options }
//!     → registry.rs (identifier → factory, capability checked against the stage)
//!     → Module (one of seven stage contracts)
//!     → Workflow stage lists (shared modules reused across workflows)
//! ```
//!
//! # Stage contracts
//! | Stage | Ok | Err |
//! |---|---|---|
//! | Prerequisite | fulfilled | abort with reason |
//! | Processor | data transformed | abort |
//! | Validator | valid | abort with reason |
//! | Cacher::start | cache hit, response written | miss, continue |
//! | Cacher::cache | persisted | logged |
//! | Proxy | claimed and served | not applicable |
//! | Enricher | body mutated | logged |
//! | ErrorResponseWrapper | `true` = handled | `false` = try next |
//!
//! # Design Decisions
//! - Configuration selects a registered identifier, never a code path
//! - Modules gate themselves through the shared memoised filters
//! - Shared state (TTL cache, upstream client) is injected at construction

pub mod builtin;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ModuleError, PipelineError};
use crate::filter::{filters_match, Filter};
use crate::http::context::RequestContext;
use crate::http::response::ResponseContext;

pub use registry::{ModuleContext, ModuleRegistry};

/// The seven stage contracts a module can satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Prerequisite,
    Processor,
    Validator,
    Cacher,
    Proxy,
    Enricher,
    ErrorResponseWrapper,
}

impl Capability {
    /// Workflow config key listing modules of this capability.
    pub fn config_key(self) -> &'static str {
        match self {
            Capability::Prerequisite => "prerequisites",
            Capability::Processor => "processors",
            Capability::Validator => "validators",
            Capability::Cacher => "cachers",
            Capability::Proxy => "proxies",
            Capability::Enricher => "enrichers",
            Capability::ErrorResponseWrapper => "errorResponseWrappers",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_key())
    }
}

/// Mutable data threaded through the processor chain.
pub struct PipelineData<'a> {
    pub request: &'a mut RequestContext,
    pub response: &'a ResponseContext,
}

/// Synchronous, cheap check run before the body is read.
pub trait Prerequisite: Send + Sync {
    fn is_fulfilled(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError>;
}

/// Transforms the request (URL, body, session, cache key) in configured order.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, data: &mut PipelineData<'_>) -> Result<(), ModuleError>;
}

/// Checks the processed request; never transforms it.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError>;
}

/// Response cache.
#[async_trait]
pub trait Cacher: Send + Sync {
    /// Serve from cache. `Ok` means a hit: the response has been written.
    /// Any `Err` is a miss and lets the pipeline continue.
    async fn start(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError>;

    /// Persist a complete, enriched response for future hits.
    async fn cache(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError>;
}

/// Serves the request from an upstream. `Ok` means the proxy claimed and served it.
#[async_trait]
pub trait Proxy: Send + Sync {
    async fn proxy(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError>;
}

/// Rewrites the buffered response body in place.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError>;
}

/// Turns a pipeline error into a client response. Returns `true` when handled.
pub trait ErrorResponseWrapper: Send + Sync {
    fn wrap(&self, err: &PipelineError, request: &RequestContext, response: &ResponseContext) -> bool;
}

/// A built module, tagged with the contract it satisfies.
#[derive(Clone)]
pub enum Module {
    Prerequisite(Arc<dyn Prerequisite>),
    Processor(Arc<dyn Processor>),
    Validator(Arc<dyn Validator>),
    Cacher(Arc<dyn Cacher>),
    Proxy(Arc<dyn Proxy>),
    Enricher(Arc<dyn Enricher>),
    ErrorResponseWrapper(Arc<dyn ErrorResponseWrapper>),
}

impl Module {
    pub fn capability(&self) -> Capability {
        match self {
            Module::Prerequisite(_) => Capability::Prerequisite,
            Module::Processor(_) => Capability::Processor,
            Module::Validator(_) => Capability::Validator,
            Module::Cacher(_) => Capability::Cacher,
            Module::Proxy(_) => Capability::Proxy,
            Module::Enricher(_) => Capability::Enricher,
            Module::ErrorResponseWrapper(_) => Capability::ErrorResponseWrapper,
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module({})", self.capability())
    }
}

/// A module placed in a workflow stage, with the name it is logged under.
pub struct Slot<T: ?Sized> {
    pub name: Arc<str>,
    pub module: Arc<T>,
}

impl<T: ?Sized> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            module: Arc::clone(&self.module),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("name", &self.name).finish()
    }
}

/// Filters a module gates itself with. Empty means "always applies".
#[derive(Debug, Clone, Default)]
pub struct ModuleFilters {
    filters: Vec<Arc<Filter>>,
}

impl ModuleFilters {
    pub fn new(filters: Vec<Arc<Filter>>) -> Self {
        Self { filters }
    }

    pub fn matches(&self, request: &RequestContext) -> bool {
        filters_match(&self.filters, request)
    }
}
