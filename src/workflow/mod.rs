//! Workflow construction and the staged pipeline interpreter.
//!
//! # Data Flow
//! ```text
//! handle():  eligibility (own filters) → claim the response
//!
//! run():     Stage::PIPELINE
//!              Prerequisites  sync   abort on first failure
//!              ReadBody       chain  body read once, line breaks stripped
//!              Processors     chain  configured order
//!              Validators     chain  configured order
//!              CacheCheck     race   intercept response; any Ok = served from cache
//!              Proxy          race   first Ok serves; all declined = "No proxy found"
//!            → finish: gunzip → enrichers (chain) → flush (re-gzip) → cachers.cache()
//!            ↘ on error: error response wrappers until one handles it
//! ```
//!
//! # Design Decisions
//! - Workflows are immutable once built; reload builds a fresh graph
//! - `extends` prepends the base workflow's stage lists, stage by stage
//! - Shared named modules are instantiated once and reused by every workflow
//! - Race participants write into private forks of the response; only the winner's is adopted
//! - Race losers are dropped (cancelled) as soon as a winner is known

pub mod stage;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::FutureExt;

use crate::config::{GatewayConfig, ModuleRef};
use crate::error::{GatewayError, ModuleError, PipelineError};
use crate::filter::{filters_match, Filter};
use crate::http::context::RequestContext;
use crate::http::response::ResponseContext;
use crate::modules::registry::{ModuleContext, ModuleRegistry};
use crate::modules::{
    Cacher, Capability, Enricher, ErrorResponseWrapper, Module, PipelineData, Prerequisite, Processor,
    Proxy, Slot, Validator,
};

use self::stage::{race, Stage};

/// Per-stage module lists of one workflow.
#[derive(Clone, Default)]
struct StageLists {
    prerequisites: Vec<Slot<dyn Prerequisite>>,
    processors: Vec<Slot<dyn Processor>>,
    validators: Vec<Slot<dyn Validator>>,
    cachers: Vec<Slot<dyn Cacher>>,
    proxies: Vec<Slot<dyn Proxy>>,
    enrichers: Vec<Slot<dyn Enricher>>,
    error_wrappers: Vec<Slot<dyn ErrorResponseWrapper>>,
}

impl StageLists {
    fn push(&mut self, stage: Capability, name: Arc<str>, module: Module) -> Result<(), GatewayError> {
        match (stage, module) {
            (Capability::Prerequisite, Module::Prerequisite(module)) => self.prerequisites.push(Slot { name, module }),
            (Capability::Processor, Module::Processor(module)) => self.processors.push(Slot { name, module }),
            (Capability::Validator, Module::Validator(module)) => self.validators.push(Slot { name, module }),
            (Capability::Cacher, Module::Cacher(module)) => self.cachers.push(Slot { name, module }),
            (Capability::Proxy, Module::Proxy(module)) => self.proxies.push(Slot { name, module }),
            (Capability::Enricher, Module::Enricher(module)) => self.enrichers.push(Slot { name, module }),
            (Capability::ErrorResponseWrapper, Module::ErrorResponseWrapper(module)) => {
                self.error_wrappers.push(Slot { name, module })
            }
            (stage, module) => {
                return Err(GatewayError::module(format!(
                    "module [{}] is one of the {} and cannot be placed in {}",
                    name,
                    module.capability(),
                    stage
                )));
            }
        }
        Ok(())
    }

    fn names(&self, stage: Capability) -> Vec<&str> {
        fn names<T: ?Sized>(slots: &[Slot<T>]) -> Vec<&str> {
            slots.iter().map(|s| &*s.name).collect()
        }
        match stage {
            Capability::Prerequisite => names(&self.prerequisites),
            Capability::Processor => names(&self.processors),
            Capability::Validator => names(&self.validators),
            Capability::Cacher => names(&self.cachers),
            Capability::Proxy => names(&self.proxies),
            Capability::Enricher => names(&self.enrichers),
            Capability::ErrorResponseWrapper => names(&self.error_wrappers),
        }
    }
}

/// How a successful pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Served,
}

/// An immutable composition of modules across the pipeline stages.
pub struct Workflow {
    name: Arc<str>,
    filters: Vec<Arc<Filter>>,
    stages: StageLists,
    body_limit: usize,
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module names placed in a stage, base workflow's first.
    pub fn module_names(&self, stage: Capability) -> Vec<&str> {
        self.stages.names(stage)
    }

    /// Whether the workflow's own filters accept the request (memoised).
    pub fn is_eligible(&self, request: &RequestContext) -> bool {
        filters_match(&self.filters, request)
    }

    /// Eligibility check plus claim. `Ok` means this workflow owns the request.
    ///
    /// A declined request is `FilterMismatch`, not an error.
    pub async fn handle(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), PipelineError> {
        if !self.is_eligible(request) {
            return Err(PipelineError::FilterMismatch);
        }
        if !response.claim(&self.name) {
            return Err(PipelineError::Claimed);
        }
        tracing::debug!(request_id = %request.id(), workflow = %self.name, "Workflow claimed request");
        Ok(())
    }

    /// Run the staged pipeline for a claimed request.
    ///
    /// Errors handled by an error response wrapper resolve `Ok`; unhandled ones are
    /// returned for the dispatcher to map.
    pub async fn run(&self, request: &mut RequestContext, response: &ResponseContext) -> Result<(), PipelineError> {
        match self.execute(request, response).await {
            Ok(_) => {
                self.finish(request, response).await;
                Ok(())
            }
            Err(PipelineError::Aborted) => {
                tracing::debug!(request_id = %request.id(), workflow = %self.name, "Pipeline stopped by module");
                response.flush();
                Ok(())
            }
            Err(err) => {
                tracing::error!(request_id = %request.id(), workflow = %self.name, error = %err, "Request error");
                response.discard();
                if self.wrap_error(&err, request, response) {
                    response.flush();
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// `handle` followed by `run`.
    pub async fn serve(&self, request: &mut RequestContext, response: &ResponseContext) -> Result<(), PipelineError> {
        self.handle(request, response).await?;
        self.run(request, response).await
    }

    async fn execute(&self, request: &mut RequestContext, response: &ResponseContext) -> Result<Flow, PipelineError> {
        for stage in Stage::PIPELINE {
            let flow = match stage {
                Stage::Prerequisites => self.check_prerequisites(request, response)?,
                Stage::ReadBody => {
                    request
                        .read_body(self.body_limit)
                        .await
                        .map_err(|e| PipelineError::from_stage(stage, e))?;
                    Flow::Continue
                }
                Stage::Processors => self.process(request, response).await?,
                Stage::Validators => self.validate(request, response).await?,
                Stage::CacheCheck => {
                    response.intercept();
                    self.check_cache(request, response).await
                }
                Stage::Proxy => self.proxy(request, response).await?,
            };
            tracing::trace!(request_id = %request.id(), workflow = %self.name, stage = %stage, "Stage complete");
            if flow == Flow::Served {
                return Ok(flow);
            }
        }
        Ok(Flow::Continue)
    }

    fn check_prerequisites(&self, request: &RequestContext, response: &ResponseContext) -> Result<Flow, PipelineError> {
        for slot in &self.stages.prerequisites {
            slot.module
                .is_fulfilled(request, response)
                .map_err(|e| self.stage_error(Stage::Prerequisites, slot, request, e))?;
        }
        Ok(Flow::Continue)
    }

    async fn process(&self, request: &mut RequestContext, response: &ResponseContext) -> Result<Flow, PipelineError> {
        let mut data = PipelineData { request, response };
        for slot in &self.stages.processors {
            if let Err(e) = slot.module.process(&mut data).await {
                return Err(self.stage_error(Stage::Processors, slot, data.request, e));
            }
        }
        Ok(Flow::Continue)
    }

    async fn validate(&self, request: &RequestContext, response: &ResponseContext) -> Result<Flow, PipelineError> {
        for slot in &self.stages.validators {
            slot.module
                .validate(request, response)
                .await
                .map_err(|e| self.stage_error(Stage::Validators, slot, request, e))?;
        }
        Ok(Flow::Continue)
    }

    /// Any cacher resolving means the response was served from cache.
    ///
    /// Each cacher writes into its own fork of the response; only the hit is adopted.
    async fn check_cache(&self, request: &RequestContext, response: &ResponseContext) -> Flow {
        if self.stages.cachers.is_empty() {
            return Flow::Continue;
        }
        let mut forks: Vec<ResponseContext> = self.stages.cachers.iter().map(|_| response.fork()).collect();
        let lookups = self
            .stages
            .cachers
            .iter()
            .zip(&forks)
            .enumerate()
            .map(|(i, (slot, fork))| async move { slot.module.start(request, fork).await.map(|()| i) }.boxed())
            .collect();
        let outcome = race(lookups).await;
        match outcome {
            Ok(hit) => {
                response.adopt(forks.swap_remove(hit));
                response.mark_from_cache();
                tracing::debug!(request_id = %request.id(), workflow = %self.name, "Served from cache");
                Flow::Served
            }
            Err(misses) => {
                for miss in misses.iter().filter(|e| !matches!(e, ModuleError::NotApplicable)) {
                    tracing::debug!(request_id = %request.id(), workflow = %self.name, reason = %miss, "Cache miss");
                }
                Flow::Continue
            }
        }
    }

    /// First proxy to succeed serves the response; the others' output is dropped with their forks.
    async fn proxy(&self, request: &RequestContext, response: &ResponseContext) -> Result<Flow, PipelineError> {
        if self.stages.proxies.is_empty() {
            return Err(PipelineError::NoProxyDefined);
        }
        let mut forks: Vec<ResponseContext> = self.stages.proxies.iter().map(|_| response.fork()).collect();
        let attempts = self
            .stages
            .proxies
            .iter()
            .zip(&forks)
            .enumerate()
            .map(|(i, (slot, fork))| {
                async move { slot.module.proxy(request, fork).await.map(|()| i).map_err(|e| (i, e)) }.boxed()
            })
            .collect();
        let outcome = race(attempts).await;
        match outcome {
            Ok(winner) => {
                response.adopt(forks.swap_remove(winner));
                Ok(Flow::Continue)
            }
            Err(errors) => match errors.into_iter().find(|(_, e)| !matches!(e, ModuleError::NotApplicable)) {
                None => Err(PipelineError::NoProxyMatched),
                Some((answered, ModuleError::Answered)) => {
                    response.adopt(forks.swap_remove(answered));
                    Err(PipelineError::Aborted)
                }
                Some((_, e)) => Err(PipelineError::Upstream(e)),
            },
        }
    }

    /// Post-process a complete response: enrich, flush, then persist through the cachers.
    async fn finish(&self, request: &RequestContext, response: &ResponseContext) {
        let from_cache = response.is_from_cache();
        let gzip = response.is_gzip();

        if gzip {
            if let Err(e) = response.decode_gzip() {
                tracing::warn!(request_id = %request.id(), error = %e, "Failed to gunzip response, sending as received");
                response.flush();
                return;
            }
        }

        if !from_cache && !response.body().is_empty() {
            for slot in &self.stages.enrichers {
                if let Err(e) = slot.module.enrich(request, response).await {
                    tracing::warn!(request_id = %request.id(), module = %slot.name, error = %e, "Enricher failed");
                }
            }
        }

        if gzip {
            if let Err(e) = response.flush_gzip() {
                tracing::error!(request_id = %request.id(), error = %e, "Failed to gzip response");
                response.flush();
            }
        } else {
            response.flush();
        }

        if from_cache || response.is_cache_disabled() || response.body().is_empty() {
            return;
        }
        let writes = self
            .stages
            .cachers
            .iter()
            .map(|slot| async move { (slot, slot.module.cache(request, response).await) });
        for (slot, result) in join_all(writes).await {
            if let Err(e) = result {
                tracing::warn!(request_id = %request.id(), module = %slot.name, error = %e, "Cacher failed to store response");
            }
        }
    }

    /// Hand the error to the wrappers in order until one handles it.
    fn wrap_error(&self, err: &PipelineError, request: &RequestContext, response: &ResponseContext) -> bool {
        self.stages
            .error_wrappers
            .iter()
            .any(|slot| slot.module.wrap(err, request, response))
    }

    fn stage_error<T: ?Sized>(
        &self,
        stage: Stage,
        slot: &Slot<T>,
        request: &RequestContext,
        err: ModuleError,
    ) -> PipelineError {
        tracing::debug!(
            request_id = %request.id(),
            workflow = %self.name,
            stage = %stage,
            module = %slot.name,
            error = %err,
            "Stage aborted"
        );
        PipelineError::from_stage(stage, err)
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Build every configured workflow, bases before the workflows extending them.
///
/// The result is ordered by workflow name.
pub fn build_workflows(
    config: &GatewayConfig,
    registry: &ModuleRegistry,
    ctx: &ModuleContext,
) -> Result<Vec<Arc<Workflow>>, GatewayError> {
    let mut builder = Builder {
        config,
        registry,
        ctx,
        shared: HashMap::new(),
        built: BTreeMap::new(),
        visiting: HashSet::new(),
    };
    for name in config.workflows.keys() {
        builder.workflow(name)?;
    }
    tracing::info!(
        workflows = builder.built.len(),
        shared_modules = builder.shared.len(),
        "Workflows built"
    );
    Ok(builder.built.into_values().collect())
}

struct Builder<'a> {
    config: &'a GatewayConfig,
    registry: &'a ModuleRegistry,
    ctx: &'a ModuleContext,
    shared: HashMap<String, Module>,
    built: BTreeMap<String, Arc<Workflow>>,
    visiting: HashSet<String>,
}

impl Builder<'_> {
    fn workflow(&mut self, name: &str) -> Result<Arc<Workflow>, GatewayError> {
        if let Some(workflow) = self.built.get(name) {
            return Ok(Arc::clone(workflow));
        }
        if !self.visiting.insert(name.to_string()) {
            return Err(GatewayError::module(format!("workflow [{}] has an extends cycle", name)));
        }
        let configs = self.config;
        let config = configs
            .workflows
            .get(name)
            .ok_or_else(|| GatewayError::module(format!("workflow [{}] is not defined", name)))?;

        let mut stages = match &config.extends {
            Some(base) => self.workflow(base)?.stages.clone(),
            None => StageLists::default(),
        };
        for (stage, refs) in config.stage_refs() {
            for module_ref in refs {
                let (module_name, module) = self.module(name, module_ref)?;
                stages.push(stage, module_name, module)?;
            }
        }

        let workflow = Arc::new(Workflow {
            name: Arc::from(name),
            filters: self.ctx.resolve_filters(&config.filters)?,
            stages,
            body_limit: self.ctx.body_limit,
        });
        self.visiting.remove(name);
        self.built.insert(name.to_string(), Arc::clone(&workflow));
        Ok(workflow)
    }

    fn module(&mut self, workflow: &str, module_ref: &ModuleRef) -> Result<(Arc<str>, Module), GatewayError> {
        match module_ref {
            ModuleRef::Named(name) => {
                if let Some(module) = self.shared.get(name) {
                    return Ok((Arc::from(name.as_str()), module.clone()));
                }
                let configs = self.config;
                let config = configs.modules.get(name).ok_or_else(|| {
                    GatewayError::module(format!("Module {} is not defined for workflow {}", name, workflow))
                })?;
                let module = self.registry.build(config, self.ctx)?;
                self.shared.insert(name.clone(), module.clone());
                Ok((Arc::from(name.as_str()), module))
            }
            ModuleRef::Inline(config) => {
                let module = self.registry.build(config, self.ctx)?;
                Ok((Arc::from(config.require.as_str()), module))
            }
        }
    }
}

#[cfg(test)]
mod tests;
